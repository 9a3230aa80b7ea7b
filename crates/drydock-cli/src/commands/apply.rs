use super::{json_pretty, parse_vars, report_error, spin_fail, spin_ok, spinner, EventPrinter, EXIT_SUCCESS};
use drydock_core::Engine;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn run(
    engine: &Engine,
    path: &Path,
    vars: &[String],
    var_file: Option<&Path>,
    cancel: &CancellationToken,
    json: bool,
) -> Result<u8, String> {
    let variables = match parse_vars(vars) {
        Ok(v) => v,
        Err(e) => return Ok(report_error(&e, json)),
    };

    let printer = if json {
        None
    } else {
        let pb = spinner("applying blueprint...");
        Some((EventPrinter::start(engine.events(), pb.clone()), pb))
    };

    let result = engine
        .apply_with_variables(path, &variables, var_file, cancel)
        .await;

    if let Some((printer, pb)) = printer {
        printer.finish().await;
        match &result {
            Ok(state) => spin_ok(&pb, &format!("applied {} resource(s)", state.len())),
            Err(e) if e.is_cancelled() => spin_fail(&pb, "apply cancelled"),
            Err(_) => spin_fail(&pb, "apply failed"),
        }
    }

    match result {
        Ok(_) => {
            let summary = engine.status();
            if json {
                println!("{}", json_pretty(&summary)?);
            } else {
                println!(
                    "{} created, {} disabled, {} total",
                    summary.created, summary.disabled, summary.total
                );
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => Ok(report_error(&e, json)),
    }
}
