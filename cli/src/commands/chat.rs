use std::io::Write;

use futures::StreamExt;
use lore_core::chat::StreamEvent;
use serde_json::json;
use uuid::Uuid;

use crate::util::{api_request, client};

pub async fn run(api_url: &str, query: &str, chat_id: Option<Uuid>, stream: bool) -> i32 {
    let mut body = json!({ "query": query });
    if let Some(chat_id) = chat_id {
        body["chat_id"] = json!(chat_id);
    }
    if stream {
        return stream_chat(api_url, body).await;
    }
    api_request(api_url, reqwest::Method::POST, "/api/chat", Some(body), &[]).await
}

pub async fn feedback(api_url: &str, chat_id: Uuid, text: &str) -> i32 {
    let path = format!("/api/chat/{chat_id}/feedback");
    let body = json!({ "feedback": text });
    api_request(api_url, reqwest::Method::POST, &path, Some(body), &[]).await
}

/// Consumes the SSE stream: answer text goes to stdout as it arrives,
/// metadata/done/error events go to stderr as JSON lines.
async fn stream_chat(api_url: &str, body: serde_json::Value) -> i32 {
    let url = match reqwest::Url::parse(&format!("{api_url}/api/chat/stream")) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Invalid URL: {api_url}/api/chat/stream: {e}");
            return 4;
        }
    };
    let resp = match client().post(url).json(&body).send().await {
        Ok(resp) => resp,
        Err(e) => {
            let error = json!({
                "error": "connection_error",
                "message": e.to_string(),
                "docs_hint": "Is the API server running? Check LORE_API_URL.",
            });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&error).unwrap_or_default()
            );
            return 3;
        }
    };
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let value: serde_json::Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({"error": "raw_error", "message": text}));
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_default()
        );
        return if status.is_client_error() { 1 } else { 2 };
    }

    let mut frames = resp.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(chunk) = frames.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                println!();
                eprintln!("Stream interrupted: {e}");
                return 3;
            }
        };
        buffer.extend(chunk.iter().copied().filter(|&b| b != b'\r'));
        while let Some(pos) = frame_boundary(&buffer) {
            let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
            let Some(data) = frame_data(&String::from_utf8_lossy(&frame)) else {
                // Keep-alive comments and other non-data frames.
                continue;
            };
            let event: StreamEvent = match serde_json::from_str(&data) {
                Ok(event) => event,
                Err(_) => continue,
            };
            match event {
                StreamEvent::Chunk { text } => {
                    print!("{text}");
                    let _ = stdout.flush();
                }
                StreamEvent::Metadata { .. } => eprintln!("{data}"),
                StreamEvent::Done { .. } => {
                    println!();
                    eprintln!("{data}");
                    return 0;
                }
                StreamEvent::Error { .. } => {
                    println!();
                    eprintln!("{data}");
                    return 2;
                }
            }
        }
    }
    println!();
    eprintln!("Stream ended before completion");
    3
}

fn frame_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Joins the `data:` lines of one SSE frame; `None` for comment-only frames.
fn frame_data(frame: &str) -> Option<String> {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() { None } else { Some(data) }
}
