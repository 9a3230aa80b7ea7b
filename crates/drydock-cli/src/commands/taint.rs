use super::{json_pretty, report_error, EXIT_SUCCESS};
use drydock_core::Engine;

pub async fn run(engine: &Engine, id: &str, json: bool) -> Result<u8, String> {
    match engine.taint(id).await {
        Ok(resource) => {
            if json {
                let payload = serde_json::json!({
                    "id": resource.id(),
                    "status": "tainted",
                });
                println!("{}", json_pretty(&payload)?);
            } else {
                println!("{id} will be recreated on the next apply");
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => Ok(report_error(&e, json)),
    }
}
