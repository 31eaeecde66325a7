//! Montage formulas: normalization, classification, kernel building and
//! dispatch.
//!
//! A montage maps the input channels of a block to one output channel. Two
//! common shapes never reach the compiler: `out = in(INDEX);` (Identity) and
//! `out = in(k);` for a literal `k` (Copy). Everything else is wrapped in the
//! kernel template and compiled, going through three cache tiers:
//!
//! 1. kernels built in the current pass, shared between identical sources;
//! 2. the context's in-memory [`cache::KernelCache`];
//! 3. the context's persistent [`cache::BinaryCache`].

pub mod cache;
pub mod lexer;
mod processor;

pub use processor::MontageProcessor;

use crate::context::ComputeContext;
use crate::device::{Kernel, Precision, Program};
use crate::error::{ComputeError, Result};
use crate::profile_scope;
use lexer::{render, tokenize, Token, TokenKind};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// How a montage is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MontageKind {
    Identity,
    /// Copy of one input channel; out-of-range channels read as zero.
    Copy(i64),
    Compiled,
}

/// One output channel: its normalized formula and the kernel computing it.
#[derive(Debug, Clone)]
pub struct Montage {
    source: String,
    kind: MontageKind,
    kernel: Arc<Kernel>,
}

impl Montage {
    /// Normalized formula text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> MontageKind {
        self.kind
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn precision(&self) -> Precision {
        self.kernel.precision()
    }

    /// Check that `source` builds, without storing anything in the
    /// persistent cache. Successfully compiled kernels do enter the
    /// in-memory cache.
    pub fn validate(
        context: &ComputeContext,
        source: &str,
        labels: &[String],
        header: &str,
    ) -> Result<MontageKind> {
        let prepared = prepare(source, labels, header, context.precision())?;
        if let Some(text) = &prepared.kernel_source {
            if !context.kernel_cache().contains(text) {
                compile_missing(context, std::slice::from_ref(text), false)?;
            }
        }
        Ok(prepared.kind)
    }
}

struct Prepared {
    normalized: String,
    kind: MontageKind,
    kernel_source: Option<String>,
}

fn prepare(source: &str, labels: &[String], header: &str, precision: Precision) -> Result<Prepared> {
    let tokens = normalize_tokens(source, labels)?;
    let kind = classify(&tokens);
    let normalized = render(&tokens);
    let kernel_source = (kind == MontageKind::Compiled)
        .then(|| kernel_source(header, &normalized, precision));
    Ok(Prepared {
        normalized,
        kind,
        kernel_source,
    })
}

/// Canonical form of a montage formula.
///
/// Comments are removed, `in("label")` style calls (also `x`, `y`, `z`)
/// become channel indices, with `-1` for unknown labels, tokens are
/// re-rendered with canonical spacing and a trailing `;` is ensured.
pub fn normalize(source: &str, labels: &[String]) -> Result<String> {
    normalize_tokens(source, labels).map(|tokens| render(&tokens))
}

fn normalize_tokens(source: &str, labels: &[String]) -> Result<Vec<Token>> {
    let mut tokens = tokenize(source).map_err(|e| ComputeError::Compile {
        log: format!(
            "montage:{}:{}: error: {}\n{}",
            e.line,
            e.column,
            e.message,
            source.lines().nth(e.line.saturating_sub(1)).unwrap_or("")
        ),
    })?;

    let mut i = 0;
    while i + 3 < tokens.len() {
        let is_label_call = matches!(tokens[i].ident(), Some("in" | "x" | "y" | "z"))
            && tokens[i + 1].is_punct("(")
            && matches!(tokens[i + 2].kind, TokenKind::Str(_))
            && tokens[i + 3].is_punct(")");

        if is_label_call {
            let label = match &tokens[i + 2].kind {
                TokenKind::Str(label) => label.clone(),
                _ => String::new(),
            };
            let (line, column) = (tokens[i + 2].line, tokens[i + 2].column);
            let number = |text: String| Token {
                kind: TokenKind::Number(text),
                line,
                column,
            };
            match labels.iter().position(|l| *l == label) {
                Some(index) => {
                    tokens[i + 2] = number(index.to_string());
                }
                None => {
                    log::debug!("Unknown channel label '{}' in montage", label);
                    tokens[i + 2] = number("1".to_string());
                    tokens.insert(
                        i + 2,
                        Token {
                            kind: TokenKind::Punct("-"),
                            line,
                            column,
                        },
                    );
                }
            }
        }
        i += 1;
    }

    if let Some(last) = tokens.last() {
        if !last.is_punct(";") && !last.is_punct("}") {
            let (line, column) = (last.line, last.column);
            tokens.push(Token {
                kind: TokenKind::Punct(";"),
                line,
                column,
            });
        }
    }

    Ok(tokens)
}

/// Recognize the Identity and Copy shapes on normalized tokens.
fn classify(tokens: &[Token]) -> MontageKind {
    let head = tokens.len() >= 4
        && tokens[0].is_ident("out")
        && tokens[1].is_punct("=")
        && tokens[2].is_ident("in")
        && tokens[3].is_punct("(");
    let tail = tokens.len() >= 2
        && tokens[tokens.len() - 2].is_punct(")")
        && tokens[tokens.len() - 1].is_punct(";");
    if !head || !tail {
        return MontageKind::Compiled;
    }

    match &tokens[4..tokens.len() - 2] {
        [index] if index.is_ident("INDEX") => MontageKind::Identity,
        [literal] => integer_literal(literal).map_or(MontageKind::Compiled, MontageKind::Copy),
        [minus, literal] if minus.is_punct("-") => {
            integer_literal(literal).map_or(MontageKind::Compiled, |k| MontageKind::Copy(-k))
        }
        _ => MontageKind::Compiled,
    }
}

fn integer_literal(token: &Token) -> Option<i64> {
    match &token.kind {
        TokenKind::Number(text) if text.bytes().all(|b| b.is_ascii_digit()) => text.parse().ok(),
        _ => None,
    }
}

/// Wrap a normalized formula into complete kernel source.
pub fn kernel_source(header: &str, body: &str, precision: Precision) -> String {
    format!(
        "#pragma precision {}\n{}\nkernel montage {{\n{}\n}}\n",
        precision.type_name(),
        header,
        body
    )
}

/// Build kernels for every formula in `sources`, one output channel each.
///
/// `labels` resolves quoted channel names and `header` is prepended to every
/// compiled kernel (helper functions). Distinct kernels missing from the
/// in-memory cache are loaded from the persistent cache or compiled in
/// parallel; afterwards every compiled montage takes its kernel from the
/// in-memory cache.
pub fn build_montages(
    context: &ComputeContext,
    sources: &[String],
    labels: &[String],
    header: &str,
) -> Result<Vec<Montage>> {
    profile_scope!("build montages", sources.len());
    let precision = context.precision();
    let kernel_cache = context.kernel_cache();
    kernel_cache.ensure_capacity(sources.len());

    let prepared = sources
        .iter()
        .map(|source| prepare(source, labels, header, precision))
        .collect::<Result<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let missing: Vec<String> = prepared
        .iter()
        .filter_map(|p| p.kernel_source.as_ref())
        .filter(|text| seen.insert(text.as_str()) && !kernel_cache.contains(text))
        .cloned()
        .collect();
    let built = compile_missing(context, &missing, true)?;

    let mut counts = [0usize; 3];
    let montages = prepared
        .into_iter()
        .map(|p| {
            let kernel = match (&p.kind, &p.kernel_source) {
                (MontageKind::Identity, _) => {
                    counts[0] += 1;
                    context.identity_kernel(precision)
                }
                (MontageKind::Copy(_), _) => {
                    counts[1] += 1;
                    context.copy_kernel(precision)
                }
                (MontageKind::Compiled, Some(text)) => {
                    counts[2] += 1;
                    kernel_cache
                        .get(text)
                        .or_else(|| built.get(text).cloned())
                        .ok_or_else(|| {
                            ComputeError::InvalidParameter(format!(
                                "kernel for '{}' was not built",
                                p.normalized
                            ))
                        })?
                }
                (MontageKind::Compiled, None) => {
                    return Err(ComputeError::InvalidParameter(format!(
                        "no kernel source for '{}'",
                        p.normalized
                    )))
                }
            };
            Ok(Montage {
                source: p.normalized,
                kind: p.kind,
                kernel,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    log::info!(
        "Built {} montages: {} identity, {} copy, {} compiled ({} new kernels)",
        montages.len(),
        counts[0],
        counts[1],
        counts[2],
        built.len()
    );
    Ok(montages)
}

/// Produce kernels for `sources`, none of which are in the in-memory cache.
/// Stored binaries are tried first; the rest compile on the context's pool.
/// With `persist`, fresh binaries are added to the persistent cache.
fn compile_missing(
    context: &ComputeContext,
    sources: &[String],
    persist: bool,
) -> Result<HashMap<String, Arc<Kernel>>> {
    let mut programs: Vec<(String, Program)> = Vec::new();
    let mut to_compile: Vec<&String> = Vec::new();

    match context.binary_cache() {
        Some(binary_cache) => {
            let binary_cache = binary_cache.lock();
            for source in sources {
                let loaded = binary_cache
                    .get(source)
                    .map(|binary| Program::from_binary(context.device(), source, binary));
                match loaded {
                    Some(Ok(program)) => programs.push((source.clone(), program)),
                    Some(Err(e)) => {
                        log::debug!("Stored kernel binary rejected, recompiling: {}", e);
                        to_compile.push(source);
                    }
                    None => to_compile.push(source),
                }
            }
        }
        None => to_compile.extend(sources.iter()),
    }
    let from_binary = programs.len();

    if !to_compile.is_empty() {
        profile_scope!("compile kernels", to_compile.len());
        let device = context.device();
        let compiled: Vec<Result<Program>> = context.compile_pool().install(|| {
            to_compile
                .par_iter()
                .map(|source| Program::compile(device, source))
                .collect()
        });
        for (source, result) in to_compile.into_iter().zip(compiled) {
            let program = result?;
            log::debug!("{}", program.build_log());
            if persist {
                if let Some(binary_cache) = context.binary_cache() {
                    binary_cache.lock().insert(source.clone(), program.binary()?);
                }
            }
            programs.push((source.clone(), program));
        }
    }

    log::debug!(
        "Prepared {} kernels ({} from stored binaries)",
        programs.len(),
        from_binary
    );

    let mut built = HashMap::with_capacity(programs.len());
    for (source, program) in programs {
        let kernel = Arc::new(Kernel::compiled(Arc::new(program)));
        context.kernel_cache().insert(source.clone(), Arc::clone(&kernel));
        built.insert(source, kernel);
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<String> {
        ["Fp1", "Fp2", "Cz"].iter().map(|s| s.to_string()).collect()
    }

    fn kind(source: &str) -> MontageKind {
        classify(&normalize_tokens(source, &labels()).unwrap())
    }

    #[test]
    fn test_normalization_is_whitespace_and_comment_insensitive() {
        let a = normalize("out=in(INDEX)", &[]).unwrap();
        let b = normalize("  out = in( INDEX ) ; // same\n", &[]).unwrap();
        assert_eq!(a, "out = in(INDEX);");
        assert_eq!(a, b);
    }

    #[test]
    fn test_labels_resolve_to_indices() {
        assert_eq!(
            normalize("out = in(\"Cz\") - in(\"Fp1\");", &labels()).unwrap(),
            "out = in(2) - in(0);"
        );
        assert_eq!(
            normalize("out = x(\"T3\");", &labels()).unwrap(),
            "out = x(-1);"
        );
    }

    #[test]
    fn test_classification() {
        assert_eq!(kind("out = in(INDEX);"), MontageKind::Identity);
        assert_eq!(kind("out=in(42)"), MontageKind::Copy(42));
        assert_eq!(kind("out = in(-3);"), MontageKind::Copy(-3));
        assert_eq!(kind("out = in(\"Fp2\");"), MontageKind::Copy(1));
        assert_eq!(kind("out = in(\"missing\");"), MontageKind::Copy(-1));
        assert_eq!(kind("out = in(1.5);"), MontageKind::Compiled);
        assert_eq!(kind("out = in(INDEX) * 2;"), MontageKind::Compiled);
        assert_eq!(kind("out = in(0); out += 1;"), MontageKind::Compiled);
    }

    #[test]
    fn test_kernel_source_template() {
        let text = kernel_source("float two() { return 2; }", "out = two();", Precision::Double);
        assert!(text.starts_with("#pragma precision double\n"));
        assert!(text.contains("kernel montage {\nout = two();\n}"));
    }

    #[test]
    fn test_lexical_errors_become_compile_errors() {
        let err = normalize("out = in(0) @ 2;", &[]).unwrap_err();
        assert!(matches!(err, ComputeError::Compile { .. }));
    }
}
