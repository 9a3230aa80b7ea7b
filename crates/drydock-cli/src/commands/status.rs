use super::{colorize_status, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use drydock_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let state = engine.config();
    let summary = engine.status();

    if json {
        let resources: Vec<serde_json::Value> = state
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id(),
                    "type": r.kind(),
                    "status": r.status().map(|s| s.as_str()),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "summary": summary,
            "resources": resources,
        });
        println!("{}", json_pretty(&payload)?);
    } else if state.is_empty() {
        println!("no resources in state");
    } else {
        println!("{:<10} {:<16} ID", "STATUS", "TYPE");
        for r in &state {
            let status = r.status().map_or("-", |s| s.as_str());
            println!("{:<10} {:<16} {}", colorize_status(status), r.kind(), r.id());
        }
        println!(
            "\n{} total: {} created, {} tainted, {} failed, {} disabled",
            summary.total, summary.created, summary.tainted, summary.failed, summary.disabled
        );
    }

    if summary.is_healthy() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}
