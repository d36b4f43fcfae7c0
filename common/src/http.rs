//! Surface-neutral HTTP requests and responses.
//!
//! Both binaries parse their framework's requests into `HttpRequest`, queue
//! them for the device loop, and render the returned `HttpResponse`.

use serde::Serialize;
use thiserror::Error;

use crate::{
    record::{MAX_HOSTNAME_LEN, MAX_PASSPHRASE_LEN, MAX_SSID_LEN},
    store::WifiUpdate,
};

pub const CONTENT_JSON: &str = "application/json";
pub const CONTENT_HTML: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// `POST /api/switch`: JSON status document.
    Json,
    /// `GET /on`, `GET /off`: redirect back to the control page.
    Redirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpRequest {
    Status,
    Command { token: String, reply: CommandReply },
    SaveConfig(ConfigForm),
    Restart,
    Scan,
}

/// Raw `/save` form fields, exactly as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigForm {
    pub ssid: Option<String>,
    pub pass: Option<String>,
    pub host: Option<String>,
    pub ap: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("SSID is required")]
    SsidMissing,
    #[error("{field} is longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },
    #[error("hostname may only contain letters, digits and inner hyphens")]
    InvalidHostname,
    #[error("invalid value for {field}: {value:?}")]
    InvalidFlag { field: &'static str, value: String },
}

impl ConfigForm {
    pub fn from_urlencoded(body: &str) -> Self {
        let mut form = Self::default();
        for pair in body.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode_form_value(value);
            match decode_form_value(key).as_str() {
                "ssid" => form.ssid = Some(value),
                "pass" => form.pass = Some(value),
                "host" => form.host = Some(value),
                "ap" => form.ap = Some(value),
                _ => {}
            }
        }
        form
    }

    /// An omitted passphrase keeps the stored one; an empty one selects an
    /// open network. An omitted or blank hostname keeps the stored hostname.
    pub fn validate(&self) -> Result<WifiUpdate, ValidationError> {
        let ssid = self.ssid.as_deref().unwrap_or_default();
        if ssid.trim().is_empty() {
            return Err(ValidationError::SsidMissing);
        }
        check_len("ssid", ssid, MAX_SSID_LEN)?;

        let passphrase = self.pass.as_deref();
        if let Some(passphrase) = passphrase {
            check_len("pass", passphrase, MAX_PASSPHRASE_LEN)?;
        }

        let hostname = non_blank(self.host.as_deref()).map(str::trim);
        if let Some(hostname) = hostname {
            check_len("host", hostname, MAX_HOSTNAME_LEN)?;
            if !valid_hostname(hostname) {
                return Err(ValidationError::InvalidHostname);
            }
        }

        let ap_fallback = match self.ap.as_deref().map(str::trim) {
            None | Some("") => None,
            Some("1" | "on" | "true") => Some(true),
            Some("0" | "off" | "false") => Some(false),
            Some(other) => {
                return Err(ValidationError::InvalidFlag {
                    field: "ap",
                    value: other.to_string(),
                })
            }
        };

        Ok(WifiUpdate {
            ssid: ssid.to_string(),
            passphrase: passphrase.map(str::to_string),
            hostname: hostname.map(str::to_string),
            ap_fallback,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub location: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_JSON,
                body,
                location: None,
            },
            Err(err) => Self::error(500, &format!("Failed to encode response: {err}")),
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_string(&ErrorBody { error: message })
            .unwrap_or_else(|_| String::from(r#"{"error":"internal error"}"#));
        Self {
            status,
            content_type: CONTENT_JSON,
            body,
            location: None,
        }
    }

    pub fn html(status: u16, body: String) -> Self {
        Self {
            status,
            content_type: CONTENT_HTML,
            body,
            location: None,
        }
    }

    pub fn redirect(location: &'static str) -> Self {
        Self {
            status: 303,
            content_type: CONTENT_HTML,
            body: String::new(),
            location: Some(location),
        }
    }
}

/// A server the device loop can drain without blocking.
pub trait HttpSurface {
    /// Answers every request queued so far through `handler`.
    fn serve(&mut self, handler: &mut dyn FnMut(HttpRequest) -> HttpResponse);
}

pub fn save_ack_page(ssid: &str, hostname: &str, restart_in_ms: u64) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>Saved</title></head><body>\
         <h1>Settings saved</h1>\
         <p>Joining <b>{}</b> as <b>{}</b>.</p>\
         <p>The switch restarts in {} seconds.</p>\
         </body></html>",
        escape_html(ssid),
        escape_html(hostname),
        restart_in_ms.div_ceil(1000)
    )
}

fn decode_form_value(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(value) => value.into_owned(),
        Err(_) => spaced,
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn valid_hostname(hostname: &str) -> bool {
    !hostname.starts_with('-')
        && !hostname.ends_with('-')
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn form_decoding_handles_plus_and_percent() {
        let form = ConfigForm::from_urlencoded("ssid=My+Net%21&pass=p%26ss&host=&ap=1&other=x");

        assert_eq!(
            form,
            ConfigForm {
                ssid: Some("My Net!".to_string()),
                pass: Some("p&ss".to_string()),
                host: Some(String::new()),
                ap: Some("1".to_string()),
            }
        );
    }

    #[test]
    fn empty_pass_selects_open_network_and_blank_host_keeps_stored() {
        let update = ConfigForm::from_urlencoded("ssid=Home&pass=&host=")
            .validate()
            .unwrap();

        assert_eq!(
            update,
            WifiUpdate {
                ssid: "Home".to_string(),
                passphrase: Some(String::new()),
                hostname: None,
                ap_fallback: None,
            }
        );
    }

    #[test]
    fn omitted_fields_keep_stored_values() {
        let update = ConfigForm::from_urlencoded("ssid=Home").validate().unwrap();

        assert_eq!(
            update,
            WifiUpdate {
                ssid: "Home".to_string(),
                ..WifiUpdate::default()
            }
        );
    }

    #[test]
    fn validation_rejects_bad_input() {
        let check = |body: &str| ConfigForm::from_urlencoded(body).validate().unwrap_err();

        assert_eq!(check("pass=x"), ValidationError::SsidMissing);
        assert_eq!(check("ssid=+++"), ValidationError::SsidMissing);
        assert_eq!(
            check(&format!("ssid={}", "s".repeat(32))),
            ValidationError::TooLong {
                field: "ssid",
                max: 31
            }
        );
        assert_eq!(
            check(&format!("ssid=Home&pass={}", "p".repeat(64))),
            ValidationError::TooLong {
                field: "pass",
                max: 63
            }
        );
        assert_eq!(
            check(&format!("ssid=Home&host={}", "h".repeat(32))),
            ValidationError::TooLong {
                field: "host",
                max: 31
            }
        );
        assert_eq!(check("ssid=Home&host=bad_name"), ValidationError::InvalidHostname);
        assert_eq!(check("ssid=Home&host=-lead"), ValidationError::InvalidHostname);
        assert_eq!(
            check("ssid=Home&ap=maybe"),
            ValidationError::InvalidFlag {
                field: "ap",
                value: "maybe".to_string()
            }
        );
    }

    #[test]
    fn full_form_is_accepted() {
        let update = ConfigForm::from_urlencoded("ssid=Home&pass=secret123&host=porch-1&ap=0")
            .validate()
            .unwrap();

        assert_eq!(update.passphrase.as_deref(), Some("secret123"));
        assert_eq!(update.hostname.as_deref(), Some("porch-1"));
        assert_eq!(update.ap_fallback, Some(false));
    }

    #[test]
    fn error_response_is_json() {
        let response = HttpResponse::error(400, "SSID is required");

        assert_eq!(response.status, 400);
        assert_eq!(response.content_type, CONTENT_JSON);
        assert_eq!(response.body, r#"{"error":"SSID is required"}"#);
    }

    #[test]
    fn ack_page_escapes_values() {
        let page = save_ack_page("<Home>", "relay-1", 1_500);

        assert!(page.contains("&lt;Home&gt;"));
        assert!(page.contains("restarts in 2 seconds"));
    }
}
