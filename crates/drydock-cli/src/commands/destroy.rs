use super::{report_error, spin_fail, spin_ok, spinner, EventPrinter, EXIT_SUCCESS};
use drydock_core::Engine;
use tokio_util::sync::CancellationToken;

pub async fn run(
    engine: &Engine,
    force: bool,
    cancel: &CancellationToken,
    json: bool,
) -> Result<u8, String> {
    let count = engine.config().len();
    if count == 0 {
        if json {
            println!("{{\"destroyed\": 0}}");
        } else {
            println!("nothing to destroy");
        }
        return Ok(EXIT_SUCCESS);
    }

    let printer = if json {
        None
    } else {
        let pb = spinner("destroying resources...");
        Some((EventPrinter::start(engine.events(), pb.clone()), pb))
    };

    let result = engine.destroy(force, cancel).await;

    if let Some((printer, pb)) = printer {
        printer.finish().await;
        match &result {
            Ok(()) => spin_ok(&pb, &format!("destroyed {count} resource(s)")),
            Err(_) => spin_fail(&pb, "destroy incomplete"),
        }
    }

    match result {
        Ok(()) => {
            if json {
                println!("{{\"destroyed\": {count}}}");
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => Ok(report_error(&e, json)),
    }
}
