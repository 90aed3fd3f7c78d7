//! The process-singleton inference session and its generation loop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{Backend, Token};
use super::builtin::BuiltinBackend;
use super::Options;
use crate::error::{Error, Result};

/// One predict call against a loaded session.
pub struct PredictRequest<'a> {
    pub prompt: &'a str,
    /// Token ids carried over from a previous response, evaluated as the
    /// prefix of this turn.
    pub context: &'a [Token],
    pub options: &'a Options,
}

#[derive(Debug)]
pub struct PredictResult {
    /// The flattened token sequence (prefix + prompt + generated); clients
    /// hand it back as `context` to continue the conversation.
    pub context: Vec<Token>,
    pub prompt_eval_count: usize,
    pub prompt_eval_duration: Duration,
    pub eval_count: usize,
    pub eval_duration: Duration,
}

/// Owns the backend handle for the one loaded model. At most one session
/// exists per process; the router's generate lock enforces that.
pub struct Session {
    pub id: i64,
    pub model_path: PathBuf,
    pub options: Options,
    pub load_duration: Duration,
    backend: Box<dyn Backend>,
    /// Mirror of the backend's evaluated token positions, used to reuse the
    /// longest common prefix across predict calls.
    state: Vec<Token>,
}

impl Session {
    pub fn load(model_path: &Path, adapters: &[PathBuf], options: &Options) -> Result<Session> {
        let started = Instant::now();
        let mut backend: Box<dyn Backend> =
            Box::new(BuiltinBackend::load(model_path, adapters, options)?);

        // Warm up with a single BOS token to initialise backend buffers,
        // then drop it from the tracked state so timings start clean.
        let bos = backend.bos_token();
        backend.eval(&[bos], 0)?;

        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();

        debug!(model = %model_path.display(), session = id, "loaded model");

        Ok(Session {
            id,
            model_path: model_path.to_path_buf(),
            options: options.clone(),
            load_duration: started.elapsed(),
            backend,
            state: Vec::new(),
        })
    }

    /// Whether a request for `model_path` with `options` can reuse this
    /// session, or the handle has to be rebuilt.
    pub fn needs_reload(&self, model_path: &Path, options: &Options) -> bool {
        self.model_path != model_path || self.options.load_differs(options)
    }

    /// Drive the generation loop, calling `emit` once per decoded token
    /// fragment. `emit` returning false ends generation cleanly.
    pub fn predict(
        &mut self,
        req: &PredictRequest<'_>,
        cancel: &CancellationToken,
        mut emit: impl FnMut(&str) -> bool,
    ) -> Result<PredictResult> {
        let opts = req.options;
        let n_ctx = self.backend.n_ctx();
        let n_batch = opts.num_batch.max(1);

        // A leading space matches the original tokeniser's whitespace
        // handling; BOS is only added when there is no carried context.
        let mut input: Vec<Token> = req.context.to_vec();
        let prompt = format!(" {}", req.prompt);
        let prompt_tokens = self.backend.tokenize(&prompt, input.is_empty())?;
        if prompt_tokens.is_empty() && input.is_empty() {
            return Err(Error::Tokenize);
        }
        input.extend(prompt_tokens);

        // Leave headroom for generation; drop the oldest tokens if the
        // prompt alone would fill the window.
        if input.len() > n_ctx - 4 {
            let excess = input.len() - (n_ctx - 4);
            warn!(excess, "prompt exceeds context window, truncating front");
            input.drain(..excess);
        }

        let mut cache_path = opts.prompt_cache.clone();
        if let Some(path) = &cache_path {
            if self.state.is_empty() && path.is_file() {
                self.state = self.backend.load_session(path)?;
                debug!(tokens = self.state.len(), "loaded prompt cache");
            }
        }

        // Reuse the longest already-evaluated prefix. On an exact match the
        // final token is re-evaluated to rebuild its logits.
        let mut n_past = common_prefix(&self.state, &input);
        if n_past == input.len() {
            n_past -= 1;
        }
        self.state.truncate(n_past);

        let n_keep = match opts.num_keep {
            n if n < 0 || n as usize > input.len() => input.len(),
            n => n as usize,
        };

        // Ring of committed token ids; feeds repetition penalties and the
        // context-window rotation.
        let mut last_tokens: VecDeque<Token> = input.iter().copied().collect();
        while last_tokens.len() > n_ctx {
            last_tokens.pop_front();
        }

        let prompt_started = Instant::now();
        let to_eval: Vec<Token> = input[n_past..].to_vec();
        for chunk in to_eval.chunks(n_batch) {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            self.backend.eval(chunk, n_past)?;
            n_past += chunk.len();
            self.state.extend_from_slice(chunk);
        }
        let prompt_eval_count = to_eval.len();
        let prompt_eval_duration = prompt_started.elapsed();

        // Save the evaluated prompt up front so the next process start can
        // skip it, whatever happens to this generation.
        if let Some(path) = &cache_path {
            if prompt_eval_count > 0 {
                self.backend.save_session(path, &self.state)?;
            }
        }

        let seed = if opts.seed < 0 {
            rand::random()
        } else {
            opts.seed as u64
        };
        let mut sampler = crate::sample::Sampler::new(seed);
        let params = opts.sampling_params(self.backend.eos_token());
        let mut stop = StopMatcher::new(opts.stop.clone());

        let mut context_out = input.clone();
        let mut n_remain = opts.num_predict;
        let mut eval_count = 0usize;
        let eval_started = Instant::now();

        loop {
            if n_remain == 0 {
                break;
            }
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            let mut logits = self.backend.logits();
            let window: Vec<Token> = last_tokens.iter().copied().collect();
            let id = sampler.sample(
                &mut logits,
                &window,
                self.backend.newline_token(),
                &params,
            );

            last_tokens.push_back(id);
            while last_tokens.len() > n_ctx {
                last_tokens.pop_front();
            }

            if id == self.backend.eos_token() {
                break;
            }

            let text = self.backend.detokenize(id);
            match stop.push(&text) {
                StopAction::Emit(out) => {
                    if !out.is_empty() && !emit(&out) {
                        context_out.push(id);
                        eval_count += 1;
                        break;
                    }
                }
                StopAction::Hold => {}
                StopAction::Stop(out) => {
                    if !out.is_empty() {
                        emit(&out);
                    }
                    context_out.push(id);
                    eval_count += 1;
                    break;
                }
            }

            // Commit the token. When the window is full, keep the first
            // n_keep tokens (at least BOS) and re-evaluate the newer half
            // of the recent window ahead of the new token.
            let mut commit: Vec<Token> = vec![id];
            if n_past + 1 > n_ctx {
                let keep = n_keep.clamp(1, n_past);
                let n_left = n_past - keep;
                n_past = keep;

                let take = n_left / 2;
                let recent: Vec<Token> = last_tokens
                    .iter()
                    .copied()
                    .rev()
                    .skip(1) // the token we just sampled
                    .take(take)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                let mut rotated = recent;
                rotated.push(id);
                commit = rotated;

                self.state.truncate(keep);
                // The cache no longer matches a linear prefix; stop saving.
                cache_path = None;
                debug!(n_keep = keep, reevaluated = commit.len(), "rotated context window");
            }

            for chunk in commit.chunks(n_batch) {
                self.backend.eval(chunk, n_past)?;
                n_past += chunk.len();
                self.state.extend_from_slice(chunk);
            }

            context_out.push(id);
            eval_count += 1;
            if n_remain > 0 {
                n_remain -= 1;
            }
        }

        // Text held back as a possible stop prefix that never completed.
        let leftover = stop.flush();
        if !leftover.is_empty() {
            emit(&leftover);
        }

        if let Some(path) = &cache_path {
            self.backend.save_session(path, &self.state)?;
        }

        Ok(PredictResult {
            context: context_out,
            prompt_eval_count,
            prompt_eval_duration,
            eval_count,
            eval_duration: eval_started.elapsed(),
        })
    }
}

fn common_prefix(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

enum StopAction {
    /// Safe to stream this text now.
    Emit(String),
    /// Everything decoded so far might still become a stop sequence.
    Hold,
    /// A stop sequence completed; emit this remainder and terminate.
    Stop(String),
}

/// Withholds decoded text while it could still turn into a configured stop
/// sequence, so a matched stop is never streamed to the client.
struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    fn new(stops: Vec<String>) -> Self {
        StopMatcher {
            stops,
            pending: String::new(),
        }
    }

    fn push(&mut self, text: &str) -> StopAction {
        self.pending.push_str(text);
        if self.stops.is_empty() {
            return StopAction::Emit(std::mem::take(&mut self.pending));
        }

        for stop in &self.stops {
            if let Some(pos) = self.pending.find(stop.as_str()) {
                let out = self.pending[..pos].to_string();
                self.pending.clear();
                return StopAction::Stop(out);
            }
        }

        // Hold the longest tail that is a proper prefix of some stop.
        let hold = self
            .stops
            .iter()
            .map(|s| holdback_len(&self.pending, s))
            .max()
            .unwrap_or(0);

        if hold == self.pending.len() {
            return StopAction::Hold;
        }
        let out: String = self.pending.drain(..self.pending.len() - hold).collect();
        StopAction::Emit(out)
    }

    fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

/// Length of the longest proper prefix of `stop` that `pending` ends with.
fn holdback_len(pending: &str, stop: &str) -> usize {
    let mut best = 0;
    for (i, _) in stop.char_indices().skip(1) {
        if pending.ends_with(&stop[..i]) {
            best = best.max(i);
        }
    }
    best
}
