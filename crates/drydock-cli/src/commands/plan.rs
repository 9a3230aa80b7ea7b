use super::{json_pretty, parse_vars, report_error, EXIT_SUCCESS};
use console::Style;
use drydock_core::Engine;
use drydock_schema::Resource;
use std::path::Path;

fn ids(resources: &[&Resource]) -> Vec<String> {
    resources.iter().map(|r| r.id().to_string()).collect()
}

pub async fn run(
    engine: &Engine,
    path: &Path,
    vars: &[String],
    var_file: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let variables = match parse_vars(vars) {
        Ok(v) => v,
        Err(e) => return Ok(report_error(&e, json)),
    };
    let plan = match engine.diff(path, &variables, var_file).await {
        Ok(plan) => plan,
        Err(e) => return Ok(report_error(&e, json)),
    };

    let create = ids(&plan.new_resources());
    let recreate = ids(&plan.changed());
    let unchanged = plan.unchanged().len();
    let destroy: Vec<String> = plan.removed().iter().map(|r| r.id().to_string()).collect();

    if json {
        let payload = serde_json::json!({
            "create": create,
            "recreate": recreate,
            "destroy": destroy,
            "unchanged": unchanged,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    if plan.is_empty() {
        println!("no changes, {unchanged} resource(s) up to date");
        return Ok(EXIT_SUCCESS);
    }
    for id in &create {
        println!("{} {id}", Style::new().green().apply_to("+"));
    }
    for id in &recreate {
        println!("{} {id}", Style::new().yellow().apply_to("~"));
    }
    for id in &destroy {
        println!("{} {id}", Style::new().red().apply_to("-"));
    }
    println!(
        "{} to create, {} to recreate, {} to destroy, {unchanged} unchanged",
        create.len(),
        recreate.len(),
        destroy.len()
    );
    Ok(EXIT_SUCCESS)
}
