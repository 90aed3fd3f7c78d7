//! The built-in reference backend.
//!
//! A deterministic byte-level model: the vocabulary is the 256 byte values
//! plus BOS/EOS, the logits are a pure function of the weights digest and
//! the recent context, and under greedy sampling the model walks a fixed
//! successor chain. It exists so the daemon and its tests run end-to-end
//! without a native inference library; a llama.cpp-backed implementation
//! drops in behind the same [`Backend`] trait.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::backend::{Backend, Token};
use super::Options;
use crate::error::{Error, Result};

pub const BOS: Token = 256;
pub const EOS: Token = 257;
const N_VOCAB: usize = 258;

const SESSION_MAGIC: &[u8; 4] = b"OLSN";

pub struct BuiltinBackend {
    seed: u64,
    n_ctx: usize,
    state: Vec<Token>,
}

impl BuiltinBackend {
    /// Materialise the backend from a weights blob and optional adapters.
    /// The file contents only contribute identity (the digest seeds the
    /// logit function), so distinct weights produce distinct models.
    pub fn load(model_path: &Path, adapters: &[PathBuf], options: &Options) -> Result<Self> {
        let mut hasher = Sha256::new();
        hash_file(&mut hasher, model_path)?;
        for adapter in adapters {
            hash_file(&mut hasher, adapter)?;
        }
        let digest = hasher.finalize();
        let seed = u64::from_le_bytes(digest[..8].try_into().unwrap());

        Ok(BuiltinBackend {
            seed,
            n_ctx: options.num_ctx.max(8),
            state: Vec::new(),
        })
    }

    /// The token this model deterministically prefers after `prev`.
    fn successor(prev: Option<Token>) -> Token {
        match prev {
            Some(t) if (0..256).contains(&t) => (t + 1) % 256,
            _ => b'A' as Token,
        }
    }
}

fn hash_file(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file = File::open(path)
        .map_err(|_| Error::NotFound(format!("model file {}", path.display())))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// splitmix64-style mixer; cheap and stable across platforms.
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

impl Backend for BuiltinBackend {
    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn n_vocab(&self) -> usize {
        N_VOCAB
    }

    fn bos_token(&self) -> Token {
        BOS
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn newline_token(&self) -> Token {
        b'\n' as Token
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(Token::from));
        Ok(tokens)
    }

    fn detokenize(&self, token: Token) -> String {
        match u8::try_from(token) {
            Ok(b) => char::from(b).to_string(),
            Err(_) => String::new(),
        }
    }

    fn eval(&mut self, tokens: &[Token], n_past: usize) -> Result<()> {
        if n_past > self.state.len() {
            return Err(Error::Eval(format!(
                "evaluation past position {n_past} with only {} tokens of state",
                self.state.len()
            )));
        }
        if n_past + tokens.len() > self.n_ctx {
            return Err(Error::Eval(format!(
                "context window of {} exceeded",
                self.n_ctx
            )));
        }
        self.state.truncate(n_past);
        self.state.extend_from_slice(tokens);
        Ok(())
    }

    fn logits(&self) -> Vec<f32> {
        // Noise is seeded by the weights digest and the recent context so
        // identical (model, context) pairs always score identically.
        let mut h = self.seed;
        for &t in self.state.iter().rev().take(8) {
            h = mix(h ^ t as u64);
        }

        let mut logits = vec![0.0f32; N_VOCAB];
        for (id, logit) in logits.iter_mut().enumerate() {
            let noise = mix(h ^ (id as u64).wrapping_mul(0x100000001b3)) as f32
                / u64::MAX as f32;
            *logit = noise;
        }

        logits[Self::successor(self.state.last().copied()) as usize] += 8.0;
        logits[BOS as usize] = -10.0;
        logits[EOS as usize] = -10.0;
        logits
    }

    fn save_session(&self, path: &Path, tokens: &[Token]) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(SESSION_MAGIC)?;
        file.write_all(&(tokens.len() as u32).to_le_bytes())?;
        for &t in tokens {
            file.write_all(&t.to_le_bytes())?;
        }
        Ok(())
    }

    fn load_session(&mut self, path: &Path) -> Result<Vec<Token>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        if data.len() < 8 || &data[..4] != SESSION_MAGIC {
            return Err(Error::Internal(format!(
                "invalid session file {}",
                path.display()
            )));
        }
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if data.len() != 8 + count * 4 {
            return Err(Error::Internal(format!(
                "truncated session file {}",
                path.display()
            )));
        }
        let tokens: Vec<Token> = data[8..]
            .chunks_exact(4)
            .map(|c| Token::from_le_bytes(c.try_into().unwrap()))
            .collect();
        self.state = tokens.clone();
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> BuiltinBackend {
        let weights = dir.join("weights.bin");
        std::fs::write(&weights, b"test weights").unwrap();
        BuiltinBackend::load(&weights, &[], &Options::default()).unwrap()
    }

    #[test]
    fn logits_are_deterministic_for_a_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = backend(dir.path());
        let mut b = backend(dir.path());
        let tokens = a.tokenize(" hello", true).unwrap();
        a.eval(&tokens, 0).unwrap();
        b.eval(&tokens, 0).unwrap();
        assert_eq!(a.logits(), b.logits());
    }

    #[test]
    fn greedy_argmax_follows_the_successor_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend(dir.path());
        let tokens = backend.tokenize("abc", true).unwrap();
        backend.eval(&tokens, 0).unwrap();

        let logits = backend.logits();
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0;
        assert_eq!(argmax, b'd' as usize);
    }

    #[test]
    fn eval_rejects_context_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend(dir.path());
        let tokens: Vec<Token> = (0..backend.n_ctx() as Token + 1).map(|t| t % 250).collect();
        assert!(backend.eval(&tokens, 0).is_err());
    }

    #[test]
    fn session_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = backend(dir.path());
        let tokens = backend.tokenize(" saved prompt", true).unwrap();
        let path = dir.path().join("cache.bin");
        backend.save_session(&path, &tokens).unwrap();

        let restored = backend.load_session(&path).unwrap();
        assert_eq!(restored, tokens);
    }
}
