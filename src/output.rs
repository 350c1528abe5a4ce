use crate::cli::OutputFormat;
use serde_json::json;
use swarm::error::{code, get_error_info};
use swarm::SwarmError;

/// Text mode prints `payload.message` when present, otherwise the payload.
pub fn emit_output(output: OutputFormat, command: &str, ok: bool, payload: serde_json::Value) {
    match output {
        OutputFormat::Text => payload
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| println!("{payload:#}"), |msg| println!("{msg}")),
        OutputFormat::Json => println!(
            "{}",
            json!({
                "command": command,
                "status": if ok { "ok" } else { "failed" },
                "payload": payload,
            })
        ),
    }
}

/// Prints the error together with the documented fix for its code.
pub fn emit_error(output: OutputFormat, error: &anyhow::Error) {
    let error_code = error
        .downcast_ref::<SwarmError>()
        .map_or(code::CLI_ERROR, SwarmError::code);
    let fix = get_error_info(error_code).map(|(_, fix)| fix);
    match output {
        OutputFormat::Text => {
            eprintln!("error: {error:#}");
            if let Some(fix) = fix {
                eprintln!("hint: {fix}");
            }
        }
        OutputFormat::Json => println!(
            "{}",
            json!({
                "status": "error",
                "code": error_code,
                "message": format!("{error:#}"),
                "fix": fix,
            })
        ),
    }
}

/// Exit code for a command that failed with an error. Unclassified errors
/// map to 1, the same as a failed run.
pub fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .downcast_ref::<SwarmError>()
        .map_or(1, |e| u8::try_from(e.exit_code()).unwrap_or(1))
}
