//! Prompt assembly: a small template language binding `{{ .System }}`,
//! `{{ .Prompt }}` and `{{ .First }}`, plus the bundled templates used when
//! a model carries none of its own.

use crate::error::{Error, Result};

/// Variables available to prompt templates.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    pub system: String,
    pub prompt: String,
    /// True for the opening turn of a conversation.
    pub first: bool,
}

/// Templates bundled with the daemon, matched by model file name.
const BUILTIN: &[(&str, &str)] = &[
    (
        "alpaca",
        "{{ if .System }}{{ .System }}\n\n{{ end }}### Instruction:\n{{ .Prompt }}\n\n### Response:\n",
    ),
    (
        "chatml",
        "{{ if .System }}<|im_start|>system\n{{ .System }}<|im_end|>\n{{ end }}<|im_start|>user\n{{ .Prompt }}<|im_end|>\n<|im_start|>assistant\n",
    ),
    (
        "llama2",
        "{{ if .First }}{{ if .System }}<<SYS>>\n{{ .System }}\n<</SYS>>\n\n{{ end }}{{ end }}[INST] {{ .Prompt }} [/INST] ",
    ),
    (
        "vicuna",
        "{{ if .System }}{{ .System }}\n{{ end }}USER: {{ .Prompt }}\nASSISTANT: ",
    ),
    (
        "orca",
        "{{ if .System }}### System:\n{{ .System }}\n\n{{ end }}### User:\n{{ .Prompt }}\n\n### Response:\n",
    ),
    (
        "wizard",
        "{{ if .System }}{{ .System }} {{ end }}USER: {{ .Prompt }} ASSISTANT: ",
    ),
];

/// Pick the bundled template whose name is closest (by edit distance) to
/// the base name of the model file. Ties break on declaration order.
pub fn builtin_for(model_base_name: &str) -> &'static str {
    let mut best = BUILTIN[0].1;
    let mut best_rank = usize::MAX;
    for (name, text) in BUILTIN {
        let rank = levenshtein(model_base_name, name);
        if rank < best_rank {
            best_rank = rank;
            best = text;
        }
    }
    best
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[derive(Debug, PartialEq)]
enum Tok {
    Text(String),
    Var(String),
    If(String),
    End,
}

fn lex(template: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            toks.push(Tok::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| Error::BadRequest("template: unclosed {{".to_string()))?;
        let action = after[..close].trim();

        if action == "end" {
            toks.push(Tok::End);
        } else if let Some(field) = action.strip_prefix("if ") {
            toks.push(Tok::If(field.trim().to_string()));
        } else {
            toks.push(Tok::Var(action.to_string()));
        }
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        toks.push(Tok::Text(rest.to_string()));
    }
    Ok(toks)
}

/// Execute a template against `vars`.
pub fn render(template: &str, vars: &Vars) -> Result<String> {
    let toks = lex(template)?;
    let mut out = String::new();
    // Stack of truthiness for nested {{ if }} blocks.
    let mut emitting: Vec<bool> = Vec::new();

    for tok in toks {
        match tok {
            Tok::End => {
                emitting
                    .pop()
                    .ok_or_else(|| Error::BadRequest("template: unexpected {{ end }}".to_string()))?;
            }
            Tok::If(field) => {
                let truthy = match field.as_str() {
                    ".System" => !vars.system.is_empty(),
                    ".Prompt" => !vars.prompt.is_empty(),
                    ".First" => vars.first,
                    other => {
                        return Err(Error::BadRequest(format!(
                            "template: unknown field {other:?}"
                        )))
                    }
                };
                emitting.push(truthy);
            }
            _ if emitting.iter().any(|&e| !e) => {}
            Tok::Text(text) => out.push_str(&text),
            Tok::Var(field) => match field.as_str() {
                ".System" => out.push_str(&vars.system),
                ".Prompt" => out.push_str(&vars.prompt),
                ".First" => out.push_str(if vars.first { "true" } else { "false" }),
                other => {
                    return Err(Error::BadRequest(format!(
                        "template: unknown field {other:?}"
                    )))
                }
            },
        }
    }

    if !emitting.is_empty() {
        return Err(Error::BadRequest(
            "template: missing {{ end }}".to_string(),
        ));
    }
    Ok(out)
}
