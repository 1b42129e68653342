pub mod crtsh;
pub mod rdap;

mod error;

pub use error::{Error, Result};

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Builds a client with a per-request timeout and user agent.
pub fn http_client(timeout_ms: u64, user_agent: &str) -> Result<Client> {
	Ok(Client::builder()
		.timeout(Duration::from_millis(timeout_ms))
		.user_agent(user_agent.to_string())
		.build()?)
}

/// Reads typed settings from a `[modules.<name>]` table. Missing keys fall back to the type's
/// serde defaults.
pub fn settings<T>(raw: &Map<String, Value>) -> Result<T>
where
	T: DeserializeOwned,
{
	serde_json::from_value(Value::Object(raw.clone()))
		.map_err(|err| Error::InvalidConfig { message: format!("Invalid module settings: {err}.") })
}

async fn get_json(client: &Client, url: &str) -> Result<Value> {
	let response = client.get(url).send().await.map_err(|err| classify(err, url))?;

	read_json(response, url).await
}

async fn read_json(response: Response, url: &str) -> Result<Value> {
	let status = response.status();

	if !status.is_success() {
		return Err(Error::Status { status: status.as_u16(), url: url.to_string() });
	}

	let body = response.bytes().await.map_err(|err| classify(err, url))?;

	Ok(serde_json::from_slice(&body)?)
}

fn classify(err: reqwest::Error, url: &str) -> Error {
	if err.is_timeout() { Error::Timeout { url: url.to_string() } } else { Error::Reqwest(err) }
}
