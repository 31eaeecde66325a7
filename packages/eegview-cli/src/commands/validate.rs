use super::{fail, kind_name, read_header, EngineOptions};
use crate::cli::ValidateArgs;
use crate::exit_codes;
use crate::output;
use eegview_compute::montage::normalize;
use eegview_compute::{ComputeContext, ComputeError, Montage};
use serde::Serialize;

#[derive(Serialize)]
struct ValidateOutput {
    formula: String,
    normalized: Option<String>,
    kind: Option<String>,
    valid: bool,
    error: Option<String>,
}

pub fn execute(args: ValidateArgs, options: &EngineOptions) -> i32 {
    let config = match options.load() {
        Ok(config) => config,
        Err(code) => return code,
    };
    let header = match read_header(args.header.as_deref()) {
        Ok(header) => header,
        Err(code) => return code,
    };
    let context = match ComputeContext::new(config) {
        Ok(context) => context,
        Err(e) => return fail(e),
    };

    let results: Vec<ValidateOutput> = args
        .montage
        .iter()
        .map(|formula| {
            let result = Montage::validate(&context, formula, &args.labels, &header);
            let error = result.as_ref().err().map(|e| match e {
                ComputeError::Compile { log } => log.clone(),
                other => other.to_string(),
            });
            ValidateOutput {
                formula: formula.clone(),
                normalized: normalize(formula, &args.labels).ok(),
                kind: result.as_ref().ok().map(|kind| kind_name(*kind)),
                valid: result.is_ok(),
                error,
            }
        })
        .collect();
    let failed = results.iter().filter(|r| !r.valid).count();

    if args.json {
        let code = output::print_json(&results);
        if code != exit_codes::SUCCESS {
            return code;
        }
    } else {
        for r in &results {
            match (&r.kind, &r.error) {
                (Some(kind), _) => println!(
                    "ok      {:<10} {}",
                    kind,
                    r.normalized.as_deref().unwrap_or(&r.formula)
                ),
                (None, Some(error)) => {
                    println!("failed             {}", r.formula);
                    eprintln!("Error: {}", error);
                }
                (None, None) => {}
            }
        }
    }

    if failed > 0 {
        log::info!("{} of {} montages failed to build", failed, results.len());
        exit_codes::INPUT_ERROR
    } else {
        exit_codes::SUCCESS
    }
}
