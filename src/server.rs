//! Server entry point
//!
//! Parses command-line flags, loads the model and then either serves
//! JSON-lines requests over stdin/stdout until EOF or, in embedded mode,
//! hands the live session back to the caller.

use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::inference::{EngineError, GenerationContext, ModelBackend, ModelParams, SessionHandle};
use crate::storage::{self, ServerSettings};
use crate::types::{
    CompletionRequest, DetokenizeRequest, EmbeddingRequest, StreamChunk, TokenizeRequest,
};

/// Command-line flags; each one overrides the matching stored setting
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "illama-server", version, about = "Local llama.cpp completion server")]
pub struct ServerArgs {
    /// Model file, or a file name inside the models directory
    #[arg(short, long)]
    pub model: Option<String>,

    /// Context window in tokens
    #[arg(short = 'c', long = "ctx-size")]
    pub ctx_size: Option<u32>,

    /// Tokens evaluated per forward pass
    #[arg(short = 'b', long = "batch-size")]
    pub batch_size: Option<u32>,

    /// Layers offloaded to the GPU
    #[arg(long = "n-gpu-layers", visible_alias = "ngl")]
    pub n_gpu_layers: Option<u32>,

    /// Evaluation threads
    #[arg(short, long)]
    pub threads: Option<i32>,

    /// Enable the embedding endpoint
    #[arg(long)]
    pub embedding: bool,

    /// Directory searched for .gguf files
    #[arg(long)]
    pub models_dir: Option<PathBuf>,

    /// Settings file (defaults to the data directory)
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Print the models directory contents and exit
    #[arg(long)]
    pub list_models: bool,

    /// Return the session to the caller instead of serving stdin
    #[arg(long)]
    pub embedded: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerArgs {
    /// Stored settings with the flags applied on top
    pub fn resolve_settings(&self) -> ServerSettings {
        let mut settings = match &self.settings {
            Some(path) => storage::load_settings_from(path),
            None => storage::load_settings(),
        };

        if let Some(dir) = &self.models_dir {
            settings.models_directory = dir.clone();
        }
        if let Some(n_ctx) = self.ctx_size {
            settings.context_size = n_ctx;
        }
        if let Some(n_batch) = self.batch_size {
            settings.batch_size = n_batch;
        }
        if let Some(layers) = self.n_gpu_layers {
            settings.gpu_layers = layers;
        }
        if self.threads.is_some() {
            settings.threads = self.threads;
        }
        if self.embedding {
            settings.embedding = true;
        }
        if self.model.is_some() {
            settings.default_model = self.model.clone();
        }
        settings.validate();
        settings
    }
}

/// Outcome of starting the server: exactly one of the two
pub enum Launch {
    /// The process should exit with this code
    Exit(i32),
    /// Embedded mode: a live session for in-process use
    Session(SessionHandle),
}

impl Launch {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Launch::Exit(code) => Some(*code),
            Launch::Session(_) => None,
        }
    }

    pub fn into_session(self) -> Option<SessionHandle> {
        match self {
            Launch::Session(session) => Some(session),
            Launch::Exit(_) => None,
        }
    }
}

/// Starts the server with the llama.cpp backend
#[cfg(feature = "llama")]
pub fn run_server<I, T>(args: I) -> Launch
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    run_server_with(args, |params| {
        crate::inference::llama::LlamaModelBackend::load(params)
            .map(|m| Box::new(m) as Box<dyn ModelBackend>)
    })
}

/// Starts the server, loading the model through `loader`
pub fn run_server_with<I, T, F>(args: I, loader: F) -> Launch
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: FnOnce(&ModelParams) -> Result<Box<dyn ModelBackend>, EngineError>,
{
    let args = match ServerArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return Launch::Exit(e.exit_code());
        }
    };
    let settings = args.resolve_settings();

    if args.list_models {
        return match list_models(&settings, io::stdout().lock()) {
            Ok(()) => Launch::Exit(0),
            Err(e) => {
                error!("Failed to list models: {e}");
                Launch::Exit(1)
            }
        };
    }

    let Some(name) = settings.default_model.as_deref() else {
        error!("No model given; pass --model or set default_model in the settings file");
        return Launch::Exit(1);
    };
    let model_path = match storage::resolve_model_path(name, &settings.models_directory) {
        Ok(path) => path,
        Err(e) => {
            error!(models_dir = %settings.models_directory.display(), "{e}");
            return Launch::Exit(1);
        }
    };

    let mut ctx = GenerationContext::new();
    if ctx
        .load_model_with(&settings.model_params(model_path), loader)
        .is_err()
    {
        return Launch::Exit(1);
    }
    let session = SessionHandle::new(ctx);

    if args.embedded {
        info!("Running embedded, returning session to caller");
        return Launch::Session(session);
    }

    info!("Serving JSON lines on stdin");
    match serve_lines(&session, io::stdin().lock(), io::stdout().lock()) {
        Ok(()) => Launch::Exit(0),
        Err(e) => {
            error!("Server I/O failed: {e}");
            Launch::Exit(1)
        }
    }
}

fn list_models<W: Write>(settings: &ServerSettings, mut out: W) -> Result<(), storage::StorageError> {
    for model in storage::scan_models_directory(&settings.models_directory)? {
        writeln!(out, "{}\t{}", model.filename, model.size_string())?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Endpoint {
    #[default]
    Completion,
    Embedding,
    Tokenize,
    Detokenize,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    endpoint: Endpoint,
}

#[derive(Serialize)]
struct ErrorLine {
    error: String,
}

fn write_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Answers one JSON request per input line until EOF.
///
/// Streaming completions write `{"content", "stop": false}` lines before the
/// final response. Failed requests produce an `{"error"}` line and the loop
/// continues.
pub fn serve_lines<R: BufRead, W: Write>(
    session: &SessionHandle,
    input: R,
    mut out: W,
) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = handle_line(session, &line, &mut out)? {
            write_line(&mut out, &ErrorLine { error: e.to_string() })?;
        }
    }
    Ok(())
}

/// Outer error is I/O on `out`; inner is a failed request
fn handle_line<W: Write>(
    session: &SessionHandle,
    line: &str,
    out: &mut W,
) -> io::Result<Result<(), EngineError>> {
    let envelope: Envelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(e) => return Ok(Err(e.into())),
    };

    match envelope.endpoint {
        Endpoint::Completion => {
            let request = match CompletionRequest::from_json(line) {
                Ok(request) => request,
                Err(e) => return Ok(Err(e)),
            };
            // Non-streaming text arrives in the final response instead
            let stream = request.stream;
            let mut write_error = None;
            let result = session.complete(
                request,
                &mut |chunk: &str| {
                    if stream && write_error.is_none() {
                        if let Err(e) = write_line(out, &StreamChunk::partial(chunk)) {
                            write_error = Some(e);
                        }
                    }
                },
                None,
            );
            if let Some(e) = write_error {
                return Err(e);
            }
            match result {
                Ok(response) => write_line(out, &response).map(Ok),
                Err(e) => Ok(Err(e)),
            }
        }
        Endpoint::Embedding => {
            let result = parse::<EmbeddingRequest>(line).and_then(|r| session.embedding(&r.content));
            respond(out, result)
        }
        Endpoint::Tokenize => {
            let result = parse::<TokenizeRequest>(line).and_then(|r| session.tokenize(&r.content));
            respond(out, result)
        }
        Endpoint::Detokenize => {
            let result = parse::<DetokenizeRequest>(line).and_then(|r| session.detokenize(&r.tokens));
            respond(out, result)
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, EngineError> {
    Ok(serde_json::from_str(line)?)
}

fn respond<W: Write, T: Serialize>(
    out: &mut W,
    result: Result<T, EngineError>,
) -> io::Result<Result<(), EngineError>> {
    match result {
        Ok(value) => write_line(out, &value).map(Ok),
        Err(e) => Ok(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::scripted::ScriptedModel;
    use serde_json::Value;
    use std::fs::File;
    use tempfile::TempDir;

    fn session(model: ScriptedModel) -> SessionHandle {
        SessionHandle::new(GenerationContext::with_model(Box::new(model)))
    }

    fn serve(session: &SessionHandle, input: &str) -> Vec<Value> {
        let mut out = Vec::new();
        serve_lines(session, input.as_bytes(), &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn models_dir_with(name: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join(name)).unwrap();
        dir
    }

    fn args(dir: &TempDir, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "illama-server".to_string(),
            "--settings".to_string(),
            dir.path().join("settings.json").to_string_lossy().to_string(),
            "--models-dir".to_string(),
            dir.path().to_string_lossy().to_string(),
        ];
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    #[test]
    fn test_completion_line() {
        let session = session(ScriptedModel::new(&[" world", "\n\n", "Extra"]));
        let lines = serve(&session, "{\"prompt\": \"Hello\", \"stop\": \"\\n\\n\"}\n");

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["content"], " world");
        assert_eq!(lines[0]["stop"], true);
        assert_eq!(lines[0]["stopped_word"], true);
        assert_eq!(lines[0]["stopping_word"], "\n\n");
    }

    #[test]
    fn test_streaming_completion_lines() {
        let session = session(ScriptedModel::new(&["a", "b"]));
        let lines = serve(&session, r#"{"prompt": "x", "stream": true}"#);

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], serde_json::json!({"content": "a", "stop": false}));
        assert_eq!(lines[1], serde_json::json!({"content": "b", "stop": false}));
        assert_eq!(lines[2]["stop"], true);
        assert_eq!(lines[2]["content"], "");
        assert_eq!(lines[2]["stopped_eos"], true);
    }

    #[test]
    fn test_other_endpoints() {
        let session = session(ScriptedModel::new(&[]).with_embeddings());
        let input = [
            r#"{"endpoint": "tokenize", "content": "hi"}"#,
            r#"{"endpoint": "detokenize", "tokens": [1104, 1105]}"#,
            r#"{"endpoint": "embedding", "content": "hi"}"#,
        ]
        .join("\n");
        let lines = serve(&session, &input);

        assert_eq!(lines[0], serde_json::json!({"tokens": [1104, 1105]}));
        assert_eq!(lines[1], serde_json::json!({"content": "hi"}));
        assert_eq!(lines[2]["embedding"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_errors_reported_and_loop_continues() {
        let session = session(ScriptedModel::new(&["ok"]));
        let input = [
            "not json",
            r#"{"endpoint": "teleport"}"#,
            r#"{"prompt": "x", "n_predict": -5}"#,
            "",
            r#"{"endpoint": "embedding", "content": "x"}"#,
            r#"{"prompt": "x"}"#,
        ]
        .join("\n");
        let lines = serve(&session, &input);

        assert_eq!(lines.len(), 5);
        for line in &lines[..4] {
            assert!(line["error"].is_string(), "{line}");
        }
        assert_eq!(lines[4]["content"], "ok");
    }

    #[test]
    fn test_embedded_launch_returns_session() {
        let dir = models_dir_with("tiny.gguf");
        let launch = run_server_with(args(&dir, &["-m", "tiny", "--embedded", "-c", "256"]), |params| {
            assert_eq!(params.n_ctx, 256);
            assert!(params.model_path.ends_with("tiny.gguf"));
            Ok(Box::new(ScriptedModel::new(&["hey"])) as Box<dyn ModelBackend>)
        });

        assert_eq!(launch.exit_code(), None);
        let session = launch.into_session().unwrap();
        let mut text = String::new();
        session
            .completion(r#"{"prompt": "hi"}"#, &mut |c: &str| text.push_str(c))
            .unwrap();
        assert_eq!(text, "hey");
    }

    #[test]
    fn test_launch_failures_give_exit_codes() {
        let dir = models_dir_with("tiny.gguf");
        let never = |_: &ModelParams| -> Result<Box<dyn ModelBackend>, EngineError> {
            panic!("loader must not run")
        };

        let launch = run_server_with(args(&dir, &["--no-such-flag"]), never);
        assert_eq!(launch.exit_code(), Some(2));

        let launch = run_server_with(args(&dir, &["--embedded"]), never);
        assert_eq!(launch.exit_code(), Some(1));

        let launch = run_server_with(args(&dir, &["-m", "absent", "--embedded"]), never);
        assert_eq!(launch.exit_code(), Some(1));

        let launch = run_server_with(args(&dir, &["-m", "tiny", "--embedded"]), |_| {
            Err(EngineError::ModelLoad("corrupt".into()))
        });
        assert_eq!(launch.exit_code(), Some(1));
        assert!(launch.into_session().is_none());
    }

    #[test]
    fn test_list_models() {
        let dir = models_dir_with("tiny.gguf");
        let settings = ServerArgs {
            models_dir: Some(dir.path().to_path_buf()),
            settings: Some(dir.path().join("settings.json")),
            ..ServerArgs::default()
        }
        .resolve_settings();

        let mut out = Vec::new();
        list_models(&settings, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "tiny.gguf\t0 B\n");
    }

    #[test]
    fn test_flags_override_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        storage::save_settings_to(
            &path,
            &ServerSettings {
                context_size: 4096,
                gpu_layers: 10,
                ..ServerSettings::default()
            },
        )
        .unwrap();

        let args = ServerArgs::try_parse_from([
            "illama-server",
            "--settings",
            path.to_str().unwrap(),
            "--ngl",
            "20",
            "--embedding",
        ])
        .unwrap();
        let settings = args.resolve_settings();

        assert_eq!(settings.context_size, 4096);
        assert_eq!(settings.gpu_layers, 20);
        assert!(settings.embedding);
    }
}
