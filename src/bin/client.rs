use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Local, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Line-mode terminal client. Plain text broadcasts to the room;
/// slash commands do everything else:
///
///   /register <user> <password>
///   /login <user> <password>
///   /msg <user> <text...>
///   /file <path>            (also /image, /video, /audio)
///   /users
///   /history [message_id]
///   /conversation <user>
///   /private <conversation_id>
///   /quit
#[tokio::main]
async fn main() -> Result<()> {
    let addr = env::args()
        .nth(1)
        .or_else(|| env::var("SERVER_ADDR").ok())
        .unwrap_or("127.0.0.1:8080".to_string());

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    println!("connected to {}", addr);
    let (mut reader, mut writer) = stream.into_split();

    tokio::spawn(async move {
        let mut pending = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            while let Some(end) = balanced_object_end(&pending) {
                match serde_json::from_slice::<Value>(&pending[..end]) {
                    Ok(envelope) => print_envelope(&envelope),
                    Err(e) => eprintln!("bad frame from server: {}", e),
                }
                pending.drain(..end);
            }
        }
        println!("server closed the connection");
        std::process::exit(0);
    });

    let mut username = String::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request = match parse_command(line, &mut username).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };
        writer.write_all(&serde_json::to_vec(&request)?).await?;
    }

    writer.write_all(&serde_json::to_vec(&json!({"type": "logout"}))?).await?;
    Ok(())
}

/// Turn one input line into a request, or None to quit.
async fn parse_command(line: &str, username: &mut String) -> Result<Option<Value>> {
    if !line.starts_with('/') {
        return Ok(Some(json!({"type": "text", "content": line})));
    }

    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg1 = parts.next();
    let rest = parts.next();

    let request = match command {
        "/quit" => return Ok(None),
        "/register" => {
            let (user, password) = two_args(arg1, rest, "/register <user> <password>")?;
            json!({"type": "register", "username": user, "password": password})
        }
        "/login" => {
            let (user, password) = two_args(arg1, rest, "/login <user> <password>")?;
            *username = user.to_string();
            json!({"type": "login", "username": user, "password": password})
        }
        "/msg" => {
            let (receiver, text) = two_args(arg1, rest, "/msg <user> <text>")?;
            json!({"type": "private", "receiver": receiver, "content": text})
        }
        "/file" | "/image" | "/video" | "/audio" => {
            let path = arg1.context("usage: /file <path>")?;
            let bytes = fs::read(path)
                .await
                .with_context(|| format!("reading {}", path))?;
            let filename = Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload");
            json!({
                "type": command.trim_start_matches('/'),
                "filename": filename,
                "data": STANDARD.encode(&bytes),
                "size": bytes.len(),
            })
        }
        "/users" => json!({"type": "refresh_users"}),
        "/history" => match arg1 {
            Some(cursor) => json!({"type": "get_history", "message_id": cursor}),
            None => json!({"type": "get_history"}),
        },
        "/conversation" => {
            let other = arg1.context("usage: /conversation <user>")?;
            json!({
                "type": "get_conversation",
                "username1": username.clone(),
                "username2": other,
            })
        }
        "/private" => {
            let id = arg1.context("usage: /private <conversation_id>")?;
            json!({"type": "get_private_history", "conversation_id": id})
        }
        other => anyhow::bail!("unknown command: {}", other),
    };
    Ok(Some(request))
}

fn two_args<'a>(
    first: Option<&'a str>,
    second: Option<&'a str>,
    usage: &str,
) -> Result<(&'a str, &'a str)> {
    match (first, second) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => anyhow::bail!("usage: {}", usage),
    }
}

/// End offset of the first balanced top-level JSON object, if complete.
fn balanced_object_end(buf: &[u8]) -> Option<usize> {
    let start = buf.iter().position(|b| !b.is_ascii_whitespace())?;
    if buf[start] != b'{' {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in buf[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn stamp(millis: Option<i64>) -> String {
    millis
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn print_envelope(envelope: &Value) {
    let tag = envelope["type"].as_str().unwrap_or("?");
    let when = stamp(envelope["timestamp"].as_i64());
    match tag {
        "text" => println!(
            "[{}] {}: {}",
            when, envelope["username"].as_str().unwrap_or("?"),
            envelope["content"].as_str().unwrap_or("")
        ),
        "private" => println!(
            "[{}] (private) {}: {}  [conversation {}]",
            when,
            envelope["username"].as_str().unwrap_or("?"),
            envelope["content"].as_str().unwrap_or(""),
            envelope["conversation_id"].as_str().unwrap_or("?")
        ),
        "system" => println!("[{}] * {}", when, envelope["message"].as_str().unwrap_or("")),
        "image" | "video" | "audio" | "file" => println!(
            "[{}] {} sent {} ({}, {} bytes)",
            when,
            envelope["username"].as_str().unwrap_or("?"),
            envelope["filename"].as_str().unwrap_or("?"),
            tag,
            envelope["size"].as_i64().unwrap_or(0)
        ),
        "user_list" => println!(
            "online: {}",
            envelope["users"]
                .as_array()
                .map(|users| users
                    .iter()
                    .filter_map(|u| u.as_str())
                    .collect::<Vec<_>>()
                    .join(", "))
                .unwrap_or_default()
        ),
        "get_history" | "private_history" => {
            for msg in envelope["messages"].as_array().into_iter().flatten() {
                let author = msg["author"]
                    .as_str()
                    .or(msg["sender"].as_str())
                    .unwrap_or("*");
                println!(
                    "  [{}] {}: {}  <{}>",
                    stamp(msg["created_at"].as_i64()),
                    author,
                    msg["content"].as_str().unwrap_or(""),
                    msg["message_id"].as_str().unwrap_or("?")
                );
            }
        }
        "conversation_info" => println!(
            "conversation {}",
            envelope["conversation"]["conversation_id"].as_str().unwrap_or("?")
        ),
        "error" => eprintln!("error: {}", envelope["message"].as_str().unwrap_or("")),
        _ => println!("{}", envelope),
    }
}
