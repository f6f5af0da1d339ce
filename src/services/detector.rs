use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Inputs for one detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRequest {
    /// Local copy of the image to analyse.
    pub source: PathBuf,
    /// Directory the engine writes its run directory into.
    pub output_dir: PathBuf,
    /// Name of the run directory under `output_dir`.
    pub run_name: String,
}

impl DetectionRequest {
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir.join(&self.run_name)
    }

    /// `<output_dir>/<run_name>/<basename>`
    pub fn annotated_image_path(&self) -> Option<PathBuf> {
        self.source
            .file_name()
            .map(|name| self.run_dir().join(name))
    }

    /// `<output_dir>/<run_name>/labels/<basename without extension>.txt`
    pub fn labels_path(&self) -> Option<PathBuf> {
        self.source.file_stem().map(|stem| {
            let mut file = stem.to_os_string();
            file.push(".txt");
            self.run_dir().join("labels").join(file)
        })
    }
}

/// Files produced by a detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionOutput {
    pub annotated_image: PathBuf,
    /// `None` when the engine found nothing and wrote no label file.
    pub labels_file: Option<PathBuf>,
}

impl DetectionOutput {
    /// Locate the files a finished run left behind.
    pub async fn locate(request: &DetectionRequest) -> Result<Self, DetectionError> {
        let annotated_image = request
            .annotated_image_path()
            .ok_or_else(|| DetectionError::InvalidSource(request.source.display().to_string()))?;
        if !path_exists(&annotated_image).await {
            return Err(DetectionError::MissingOutput(annotated_image.display().to_string()));
        }

        let labels_file = match request.labels_path() {
            Some(path) if path_exists(&path).await => Some(path),
            _ => None,
        };

        Ok(Self {
            annotated_image,
            labels_file,
        })
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Opaque object detector: image in, annotated image plus label file out.
#[async_trait]
pub trait DetectionEngine: Send + Sync {
    async fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutput, DetectionError>;
}

/// Runs a YOLO-style `detect` command line as a child process.
///
/// Invoked as `<program> [args..] --weights W --data D --source S --project O
/// --name R --save-txt --exist-ok`.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    weights: String,
    data: PathBuf,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>, weights: impl Into<String>, data: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            weights: weights.into(),
            data: data.into(),
        }
    }

    /// Build from a whitespace-separated command line such as `python detect.py`.
    pub fn from_command_line(
        command_line: &str,
        weights: impl Into<String>,
        data: impl Into<PathBuf>,
    ) -> Result<Self, DetectionError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| DetectionError::InvalidCommand(command_line.to_string()))?;
        Ok(Self::new(program, parts.collect(), weights, data))
    }

    fn command(&self, request: &DetectionRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--weights")
            .arg(&self.weights)
            .arg("--data")
            .arg(&self.data)
            .arg("--source")
            .arg(&request.source)
            .arg("--project")
            .arg(&request.output_dir)
            .arg("--name")
            .arg(&request.run_name)
            .arg("--save-txt")
            .arg("--exist-ok")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl DetectionEngine for CommandDetector {
    async fn detect(&self, request: &DetectionRequest) -> Result<DetectionOutput, DetectionError> {
        let start = Instant::now();
        let output = self
            .command(request)
            .output()
            .await
            .map_err(|source| DetectionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DetectionError::Failed {
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), 2048),
            });
        }

        tracing::debug!(
            run_name = %request.run_name,
            duration_ms = start.elapsed().as_millis() as u64,
            "Detector finished"
        );

        DetectionOutput::locate(request).await
    }
}

/// Last `max_bytes` of `text`, on a char boundary.
fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.trim().to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].trim().to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("failed to start detector {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("detector exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("detector produced no annotated image at {0}")]
    MissingOutput(String),

    #[error("source image path has no file name: {0}")]
    InvalidSource(String),

    #[error("detector command line is empty: {0:?}")]
    InvalidCommand(String),
}
