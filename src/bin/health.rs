use std::env;
use std::error;

use reqwest::Url;

/// Probes the health endpoint; exits non-zero when the service is down.
/// Intended as a container healthcheck.
fn main() -> Result<(), Box<dyn error::Error>> {
    let target = env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8000/health".to_string());
    let url = Url::parse(&target)?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        panic!("Health endpoint returned {}", response.status())
    }

    Ok(())
}
