use std::path::Path;

use crate::error::Result;

pub type Token = i32;

/// The capability surface the session core needs from an inference backend.
///
/// This is the seam to the native library: one implementation owns the
/// model handle, all allocations stay on its side of the boundary, and
/// failures cross as typed errors. The session core never sees anything
/// beyond this trait.
pub trait Backend: Send {
    fn n_ctx(&self) -> usize;
    fn n_vocab(&self) -> usize;
    fn bos_token(&self) -> Token;
    fn eos_token(&self) -> Token;
    fn newline_token(&self) -> Token;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Decode a single token id to its text fragment.
    fn detokenize(&self, token: Token) -> String;

    /// Evaluate `tokens` starting at position `n_past`, discarding any state
    /// the backend held beyond that position. On success the logits for the
    /// final token are available via `logits`.
    fn eval(&mut self, tokens: &[Token], n_past: usize) -> Result<()>;

    /// Logits over the vocabulary for the most recently evaluated token.
    fn logits(&self) -> Vec<f32>;

    /// Persist the evaluated token sequence so a later process can resume
    /// without re-evaluating the shared prefix.
    fn save_session(&self, path: &Path, tokens: &[Token]) -> Result<()>;

    /// Restore a saved token sequence, adopting it as the evaluated state.
    fn load_session(&mut self, path: &Path) -> Result<Vec<Token>>;
}
