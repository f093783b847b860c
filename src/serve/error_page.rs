//! Generic error responses for errors no boundary handled.
//!
//! HTML by default, JSON when the client negotiated it. Development pages
//! include the error message and captured backtrace; production pages only
//! show the status and the request id.

use hyper::StatusCode;
use serde_json::json;
use uuid::Uuid;

use crate::error::Error;
use crate::serve::response::ResponseWriter;
use crate::template::html_escape;

/// Page wording and accent class per status.
fn describe(status: StatusCode) -> (&'static str, &'static str, &'static str) {
    match status.as_u16() {
        400 => (
            "Bad Request",
            "The request could not be understood by the server.",
            "warning",
        ),
        403 => (
            "Forbidden",
            "You don't have permission to access this resource.",
            "warning",
        ),
        404 => (
            "Page Not Found",
            "The page you're looking for doesn't exist or has been moved.",
            "warning",
        ),
        405 => (
            "Method Not Allowed",
            "The HTTP method used is not allowed for this resource.",
            "warning",
        ),
        503 => (
            "Service Unavailable",
            "The service is temporarily unavailable. Please try again later.",
            "error",
        ),
        code if code >= 500 => (
            "Internal Server Error",
            "Something went wrong on our end. Please try again later.",
            "error",
        ),
        _ => (
            "Error",
            "An error occurred while processing your request.",
            "info",
        ),
    }
}

/// Write the generic response for `error` into `out`.
pub fn write_error(
    out: &mut ResponseWriter,
    error: &Error,
    request_id: Uuid,
    wants_json: bool,
    dev_mode: bool,
) {
    let status = error.status();
    out.status(status).header("x-request-id", request_id.to_string());

    if wants_json {
        let message = if dev_mode || status.is_client_error() {
            error.to_string()
        } else {
            describe(status).0.to_string()
        };
        let body = json!({
            "error": message.as_str(),
            "status": status.as_u16(),
            "request_id": request_id.to_string(),
        });
        if out.json(&body).is_err() {
            out.text(message);
        }
        return;
    }

    let page = if dev_mode {
        dev_page(status, error, request_id)
    } else {
        production_page(status, request_id)
    };
    out.html(page);
}

pub fn production_page(status: StatusCode, request_id: Uuid) -> String {
    let (heading, description, class) = describe(status);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {heading}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f8f9fa; color: #212529; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; }}
        .container {{ text-align: center; max-width: 500px; }}
        .error-code {{ font-size: 120px; font-weight: 700; line-height: 1; margin-bottom: 20px; }}
        .error-code.error {{ color: #f8d7da; }}
        .error-code.warning {{ color: #fff3cd; }}
        .error-code.info {{ color: #d1ecf1; }}
        .error-id {{ font-family: monospace; background: #e9ecef; padding: 2px 6px; border-radius: 4px; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="error-code {class}">{code}</div>
        <h1>{heading}</h1>
        <p>{description}</p>
        <p>Error ID: <span class="error-id">{request_id}</span></p>
    </div>
</body>
</html>"#,
        code = status.as_u16(),
        heading = heading,
        description = description,
        class = class,
        request_id = request_id,
    )
}

pub fn dev_page(status: StatusCode, error: &Error, request_id: Uuid) -> String {
    let trace = error
        .backtrace()
        .map(|bt| format!("<h2>Backtrace</h2>\n<pre class=\"trace\">{}</pre>", html_escape(bt)))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{code} {heading}</title>
    <style>
        body {{ font-family: ui-monospace, SFMono-Regular, Menlo, monospace; background: #1e1e2e; color: #cdd6f4; padding: 32px; }}
        h1 {{ color: #f38ba8; }}
        .message {{ background: #313244; padding: 16px; border-radius: 6px; white-space: pre-wrap; }}
        .trace {{ background: #181825; padding: 16px; border-radius: 6px; overflow-x: auto; font-size: 12px; }}
    </style>
</head>
<body>
    <h1>{code} {heading}</h1>
    <div class="message">{message}</div>
    <p>Request ID: {request_id}</p>
    {trace}
</body>
</html>"#,
        code = status.as_u16(),
        heading = describe(status).0,
        message = html_escape(&error.to_string()),
        request_id = request_id,
        trace = trace,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(error: Error, json: bool, dev: bool) -> ResponseWriter {
        let mut out = ResponseWriter::new();
        write_error(&mut out, &error, Uuid::nil(), json, dev);
        out
    }

    fn body(out: &ResponseWriter) -> String {
        String::from_utf8(out.body().to_vec()).unwrap()
    }

    #[test]
    fn test_production_page_hides_trace() {
        let out = render(Error::panic("secret <state>", "frame: db::connect"), false, false);
        let html = body(&out);
        assert_eq!(out.current_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(html.contains("Internal Server Error"));
        assert!(html.contains(&Uuid::nil().to_string()));
        assert!(!html.contains("secret"));
        assert!(!html.contains("db::connect"));
    }

    #[test]
    fn test_dev_page_shows_escaped_message_and_trace() {
        let html = body(&render(Error::panic("bad <state>", "frame: db::connect"), false, true));
        assert!(html.contains("bad &lt;state&gt;"));
        assert!(html.contains("frame: db::connect"));
    }

    #[test]
    fn test_json_error_body() {
        let out = render(Error::panic("boom", "trace"), true, false);
        let value: serde_json::Value = serde_json::from_slice(out.body()).unwrap();
        assert_eq!(
            value,
            json!({
                "error": "Internal Server Error",
                "status": 500,
                "request_id": Uuid::nil().to_string(),
            })
        );

        let out = render(Error::not_found(), true, false);
        let value: serde_json::Value = serde_json::from_slice(out.body()).unwrap();
        assert_eq!(value["error"], "not found");
        assert_eq!(value["status"], 404);
    }
}
