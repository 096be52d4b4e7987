//! fatwa-ask: one-shot client for a running fatwa-speaker-rs.
//!
//! Posts a question to the local control API, prints the answer with its
//! verbatim record, and optionally asks the service to read it aloud.

use std::io::Read;
use std::time::Duration;

use clap::Parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "fatwa-ask", about = "Ask a running fatwa-speaker-rs a question")]
struct Args {
    /// The question; read from stdin when omitted
    question: Vec<String>,

    /// Read the answer aloud on the service's audio device
    #[arg(short, long)]
    speak: bool,

    /// Control API port
    #[arg(short, long, default_value_t = 8768)]
    port: u16,

    /// Reply to an earlier message by id
    #[arg(long)]
    reply_to: Option<String>,
}

// --- API request/response types ---

#[derive(Serialize)]
struct AskRequest {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

#[derive(Serialize)]
struct PlayRequest {
    message_id: String,
}

#[derive(Deserialize)]
struct AskResponse {
    message: MessageBody,
    answer: String,
    verbatim: Option<String>,
    fatwa_id: Option<String>,
}

#[derive(Deserialize)]
struct MessageBody {
    id: String,
    #[serde(default)]
    sources: Vec<SourceBody>,
    #[serde(default)]
    failed: bool,
}

#[derive(Deserialize)]
struct SourceBody {
    title: String,
    uri: String,
}

#[derive(Deserialize)]
struct SimpleResponse {
    status: String,
    error: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let question = if args.question.is_empty() {
        let mut input = String::new();
        if std::io::stdin().read_to_string(&mut input).is_err() {
            eprintln!("failed to read question from stdin");
            std::process::exit(2);
        }
        input
    } else {
        args.question.join(" ")
    };
    let question = question.trim();
    if question.is_empty() {
        eprintln!("empty question");
        std::process::exit(2);
    }

    let api = format!("http://127.0.0.1:{}", args.port);

    // Answers stream for a while, so only the connect phase is short
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_else(|_| Client::new());

    let response = match client
        .post(format!("{api}/ask"))
        .json(&AskRequest {
            text: question.to_string(),
            reply_to: args.reply_to,
        })
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("API unreachable at {api}: {e}");
            std::process::exit(1);
        }
    };

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("failed to read response: {e}");
            std::process::exit(1);
        }
    };

    let answer: AskResponse = match serde_json::from_str(&body) {
        Ok(a) => a,
        Err(_) => {
            let error = serde_json::from_str::<SimpleResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    };

    print_answer(&answer);

    if answer.message.failed {
        std::process::exit(1);
    }

    if args.speak {
        let result = client
            .post(format!("{api}/play"))
            .json(&PlayRequest {
                message_id: answer.message.id.clone(),
            })
            .send()
            .await;
        match result {
            Ok(r) => match r.json::<SimpleResponse>().await {
                Ok(SimpleResponse { status, error: None }) => eprintln!("[{status}]"),
                Ok(SimpleResponse { error: Some(e), .. }) => eprintln!("playback error: {e}"),
                Err(e) => eprintln!("playback response unreadable: {e}"),
            },
            Err(e) => eprintln!("playback request failed: {e}"),
        }
    }
}

fn print_answer(answer: &AskResponse) {
    println!("{}", answer.answer.trim());

    if let Some(verbatim) = &answer.verbatim {
        println!("\nOFFICIAL VERBATIM RECORD");
        println!("{verbatim}");
    }
    if let Some(id) = &answer.fatwa_id {
        println!("\n[Fatwa ID: {id}]");
    }
    if !answer.message.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in answer.message.sources.iter().enumerate() {
            println!("  {}. {} <{}>", i + 1, source.title, source.uri);
        }
    }
}
