//! LaTeX generation through a vision model.
//!
//! Pages are sent in a single chat completion request. The reply is normalised into a complete,
//! compilable document by [normalize_document].

use crate::pdf::PageImage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TOKENS: u32 = 4000;

pub const CONVERSION_PROMPT: &str = "Please convert the content of these PDF pages to LaTeX code.

Requirements:
1. Create a complete, compilable LaTeX document
2. Include appropriate document class and packages
3. Preserve the structure, formatting, and mathematical expressions
4. Use proper LaTeX syntax for equations, tables, figures, etc.
5. Include section headings and proper formatting
6. If there are images or diagrams, describe them in comments
7. Make sure the output is clean and well-formatted

Return only the LaTeX code without any additional explanations or markdown formatting.";

const DOCUMENT_PREAMBLE: &str = "\\documentclass{article}
\\usepackage[utf8]{inputenc}
\\usepackage{amsmath}
\\usepackage{amsfonts}
\\usepackage{amssymb}
\\usepackage{graphicx}

\\begin{document}

";

const DOCUMENT_END: &str = "

\\end{document}";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("LaTeX generation timed out after {0}s, please try again")]
    Timeout(u64),
    #[error("LaTeX generation failed: {0}")]
    Transport(String),
    #[error("LaTeX generation failed: API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("LaTeX generation failed: no response received from the model")]
    EmptyResponse,
}

#[async_trait(?Send)]
pub trait MarkupGenerator: Send + Sync {
    /// Generates a standalone LaTeX document from page images, in page order.
    async fn generate(&self, pages: &[PageImage]) -> Result<String, GenerationError>;
}

/// [MarkupGenerator] calling an OpenAI compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn builder(api_key: impl Into<String>) -> OpenAiGeneratorBuilder {
        OpenAiGeneratorBuilder {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn request_body<'a>(&'a self, pages: &'a [PageImage]) -> ChatRequest<'a> {
        let mut content = vec![ContentPart::Text {
            text: CONVERSION_PROMPT,
        }];
        content.extend(pages.iter().map(|page| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: page.data_url(),
                detail: "high",
            },
        }));
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            temperature: 0.0,
            max_tokens: MAX_TOKENS,
        }
    }
}

pub struct OpenAiGeneratorBuilder {
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OpenAiGeneratorBuilder {
    /// Base URL of the API, without the trailing `/chat/completions`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Upper bound for a whole model call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<OpenAiGenerator, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        Ok(OpenAiGenerator {
            client,
            api_key: self.api_key,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            model: self.model,
            timeout: self.timeout,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    detail: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[async_trait(?Send)]
impl MarkupGenerator for OpenAiGenerator {
    async fn generate(&self, pages: &[PageImage]) -> Result<String, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(pages))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(GenerationError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GenerationError::EmptyResponse)?;

        log::info!(
            "Generated {} bytes of LaTeX from {} pages",
            content.len(),
            pages.len()
        );
        Ok(normalize_document(&content))
    }
}

impl OpenAiGenerator {
    fn transport_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_timeout() {
            GenerationError::Timeout(self.timeout.as_secs())
        } else {
            GenerationError::Transport(e.to_string())
        }
    }
}

/// Turns a model reply into a standalone document.
///
/// Outer code fences are stripped. A reply that contains a `\documentclass` line is cut to start
/// at that line, dropping any prose the model put before it. Anything else is wrapped in a basic
/// article shell.
pub fn normalize_document(raw: &str) -> String {
    let latex = strip_fences(raw);
    match document_start(latex) {
        Some(0) => latex.to_string(),
        Some(start) => strip_fences(&latex[start..]).to_string(),
        None => format!("{DOCUMENT_PREAMBLE}{latex}{DOCUMENT_END}"),
    }
}

fn strip_fences(raw: &str) -> &str {
    let mut latex = raw.trim();
    if let Some(rest) = latex.strip_prefix("```latex") {
        latex = rest;
    } else if let Some(rest) = latex.strip_prefix("```tex") {
        latex = rest;
    } else if let Some(rest) = latex.strip_prefix("```") {
        latex = rest;
    }
    if let Some(rest) = latex.strip_suffix("```") {
        latex = rest;
    }
    latex.trim()
}

// Byte offset of the first line that opens with `\documentclass`.
fn document_start(latex: &str) -> Option<usize> {
    let mut offset = 0;
    for line in latex.split_inclusive('\n') {
        let indent = line.len() - line.trim_start().len();
        if line[indent..].starts_with("\\documentclass") {
            return Some(offset + indent);
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOCUMENT: &str = "\\documentclass{article}\n\\begin{document}\nHello\n\\end{document}";

    fn pages(n: usize) -> Vec<PageImage> {
        (1..=n)
            .map(|page| PageImage {
                page,
                png_base64: format!("cGFnZ{page}"),
            })
            .collect()
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
    }

    #[test]
    fn test_document_with_preamble_passes_through() {
        assert_eq!(normalize_document(DOCUMENT), DOCUMENT);
    }

    #[test]
    fn test_fragment_is_wrapped() {
        let out = normalize_document("\\section{Intro}\nSome text.");
        assert!(out.starts_with("\\documentclass{article}"));
        assert!(out.contains("\\usepackage{amsmath}"));
        assert!(out.contains("\\begin{document}\n\n\\section{Intro}\nSome text.\n\n\\end{document}"));
        assert!(out.ends_with("\\end{document}"));
    }

    #[test]
    fn test_fences_are_stripped() {
        let fenced = format!("```latex\n{DOCUMENT}\n```");
        assert_eq!(normalize_document(&fenced), DOCUMENT);
        let fenced = format!("```\n{DOCUMENT}\n```\n");
        assert_eq!(normalize_document(&fenced), DOCUMENT);
    }

    #[test]
    fn test_leading_prose_is_dropped() {
        let reply = format!("Here is the code:\n\n```latex\n{DOCUMENT}\n```\nLet me know if it helps.");
        let out = normalize_document(&reply);
        assert!(out.starts_with("\\documentclass"));
        assert!(!out.contains("Here is the code"));
        assert!(out.contains("\\end{document}"));

        let reply = format!("Sure!\n{DOCUMENT}");
        assert_eq!(normalize_document(&reply), DOCUMENT);
        let reply = format!("Here is the document:\n```latex\n{DOCUMENT}\n```");
        assert_eq!(normalize_document(&reply), DOCUMENT);
        // A mention inside a sentence does not count as a preamble
        let out = normalize_document("Use \\documentclass{article} first.");
        assert!(out.starts_with("\\documentclass{article}\n"));
        assert!(out.contains("\\begin{document}\n\nUse \\documentclass{article} first."));
    }

    #[test]
    fn test_request_body_shape() {
        let generator = OpenAiGenerator::builder("sk-test").build().unwrap();
        let pages = pages(2);
        let body = serde_json::to_value(generator.request_body(&pages)).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 4000);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,cGFnZ1");
        assert_eq!(content[2]["image_url"]["detail"], "high");
    }

    #[actix_web::test]
    async fn test_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(bearer_token("sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("\\section{A}")))
            .expect(1)
            .mount(&server)
            .await;

        let generator = OpenAiGenerator::builder("sk-test")
            .base_url(server.uri())
            .build()
            .unwrap();
        let latex = generator.generate(&pages(1)).await.unwrap();
        assert!(latex.starts_with("\\documentclass{article}"));
        assert!(latex.contains("\\section{A}"));
    }

    #[actix_web::test]
    async fn test_empty_reply_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("  ")))
            .mount(&server)
            .await;
        let generator = OpenAiGenerator::builder("sk-test")
            .base_url(server.uri())
            .build()
            .unwrap();
        let err = generator.generate(&pages(1)).await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyResponse), "got: {err}");
    }

    #[actix_web::test]
    async fn test_api_error_keeps_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
            })))
            .mount(&server)
            .await;
        let generator = OpenAiGenerator::builder("sk-bad")
            .base_url(server.uri())
            .build()
            .unwrap();
        let err = generator.generate(&pages(1)).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("401"), "got: {message}");
        assert!(message.contains("Incorrect API key provided"), "got: {message}");
    }

    #[actix_web::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion(DOCUMENT))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let generator = OpenAiGenerator::builder("sk-test")
            .base_url(server.uri())
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let err = generator.generate(&pages(1)).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)), "got: {err}");
    }
}
