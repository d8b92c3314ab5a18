use crate::errors::{AppError, Result};
use crate::matrix::ColumnLayout;
use crate::region::Region;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Everything the plotting engine needs to draw one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub region: Region,
    pub slopped: Region,
    pub stem: String,
    pub params_path: PathBuf,
    pub sequence_table: PathBuf,
    /// Grouped count matrix; absent when there are no alignment inputs.
    pub matrix_table: Option<PathBuf>,
    pub nonbam_table: Option<PathBuf>,
    pub document: PathBuf,
    pub maxseq: u64,
    pub inputs: Vec<String>,
    pub names: Vec<String>,
    pub count_header: Vec<String>,
    pub group_fun: String,
    /// Column order of the count matrices; the renderer indexes columns by position.
    pub layout: ColumnLayout,
    pub rpm: bool,
}

impl RenderRequest {
    pub fn params(&self) -> Vec<(String, Vec<String>)> {
        let path = |value: &Path| value.to_string_lossy().to_string();
        let optional = |value: &Option<PathBuf>| -> Vec<String> {
            value.as_deref().map(path).into_iter().collect()
        };
        vec![
            ("region".to_string(), vec![self.stem.clone()]),
            ("chrom".to_string(), vec![self.slopped.chrom.clone()]),
            ("bstart".to_string(), vec![self.region.start.to_string()]),
            ("bend".to_string(), vec![self.region.end.to_string()]),
            ("xlim1".to_string(), vec![self.slopped.start.to_string()]),
            ("xlim2".to_string(), vec![self.slopped.end.to_string()]),
            ("maxseq".to_string(), vec![self.maxseq.to_string()]),
            ("refbases".to_string(), vec![path(&self.sequence_table)]),
            ("mcov".to_string(), optional(&self.matrix_table)),
            ("nonbam".to_string(), optional(&self.nonbam_table)),
            ("pdffile".to_string(), vec![path(&self.document)]),
            ("inputlist".to_string(), self.inputs.clone()),
            ("names".to_string(), self.names.clone()),
            ("count_header".to_string(), self.count_header.clone()),
            ("group_fun".to_string(), vec![self.group_fun.clone()]),
            ("layout".to_string(), vec![self.layout.name().to_string()]),
            ("rpm".to_string(), vec![self.rpm.to_string()]),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub document: Option<PathBuf>,
}

impl RenderOutcome {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// False for the tables-only renderer, which runs nothing and draws nothing.
    pub fn drew(&self) -> bool {
        !self.command.is_empty() || self.document.is_some()
    }

    /// Turns a failed render into [`AppError::Render`] carrying the captured output.
    pub fn into_result(self, region: &Region) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(AppError::Render {
            region: region.file_stem(),
            command: self.command,
            code: self.status,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

pub trait Renderer: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<RenderOutcome>;
}

/// Runs a user command with the parameter bundle path appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AppError::config("renderer command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    fn label(&self, params: &Path) -> String {
        let mut label = self.program.clone();
        for arg in &self.args {
            label.push(' ');
            label.push_str(arg);
        }
        label.push(' ');
        label.push_str(&params.to_string_lossy());
        label
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, request: &RenderRequest) -> Result<RenderOutcome> {
        let label = self.label(&request.params_path);
        debug!(command = %label, "running renderer");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.params_path)
            .output()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    AppError::CommandNotFound {
                        command: self.program.clone(),
                    }
                } else {
                    AppError::Io(err)
                }
            })?;

        Ok(RenderOutcome {
            command: label,
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            document: request
                .document
                .exists()
                .then(|| request.document.clone()),
        })
    }
}

/// Leaves the tables and parameter bundle in place without drawing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TablesOnly;

impl Renderer for TablesOnly {
    fn render(&self, _request: &RenderRequest) -> Result<RenderOutcome> {
        Ok(RenderOutcome {
            command: String::new(),
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            document: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandRenderer, RenderOutcome, RenderRequest, Renderer, TablesOnly};
    use crate::errors::AppError;
    use crate::matrix::ColumnLayout;
    use crate::region::Region;
    use std::path::PathBuf;

    fn request(dir: &std::path::Path) -> RenderRequest {
        let region = Region::new("chr7", 100, 200).with_name("ACTB");
        let slopped = Region::new("chr7", 95, 205).with_name("ACTB");
        let stem = region.file_stem();
        RenderRequest {
            params_path: dir.join(format!("{stem}.params.txt")),
            sequence_table: dir.join(format!("{stem}.seq.txt")),
            matrix_table: None,
            nonbam_table: Some(dir.join(format!("{stem}.nonbam.bed.txt"))),
            document: dir.join(format!("{stem}.pdf")),
            stem,
            region,
            slopped,
            maxseq: 100,
            inputs: vec!["ann.bed".to_string()],
            names: vec!["ann".to_string()],
            count_header: Vec::new(),
            group_fun: "mean".to_string(),
            layout: ColumnLayout::CountMajor,
            rpm: false,
        }
    }

    #[test]
    fn params_carry_original_and_slopped_coordinates() {
        let params = request(&PathBuf::from("/work")).params();
        let get = |key: &str| {
            params
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, values)| values.clone())
                .expect("param present")
        };
        assert_eq!(get("bstart"), vec!["100"]);
        assert_eq!(get("xlim1"), vec!["95"]);
        assert_eq!(get("xlim2"), vec!["205"]);
        assert!(get("mcov").is_empty());
        assert_eq!(get("layout"), vec!["count-major"]);
        assert_eq!(get("nonbam"), vec!["/work/chr7_100_200_ACTB.nonbam.bed.txt"]);
    }

    #[test]
    fn failed_outcome_surfaces_captured_output() {
        let outcome = RenderOutcome {
            command: "Rscript plot.R p.txt".to_string(),
            status: Some(1),
            stdout: "drawing".to_string(),
            stderr: "Error in plot".to_string(),
            document: None,
        };
        let err = outcome
            .into_result(&Region::new("chr7", 1, 2))
            .expect_err("non-zero status");
        let message = err.to_string();
        assert!(matches!(err, AppError::Render { code: Some(1), .. }));
        assert!(message.contains("Error in plot"));
        assert!(message.contains("drawing"));
    }

    #[test]
    fn tables_only_always_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = TablesOnly.render(&request(dir.path())).expect("render");
        assert!(outcome.success());
        assert!(outcome.document.is_none());
        assert!(!outcome.drew());
    }

    #[test]
    fn command_renderer_reports_missing_program() {
        let dir = tempfile::tempdir().expect("tempdir");
        let renderer = CommandRenderer::parse("genome-graphs-missing-rscript plot.R").expect("parse");
        let err = renderer.render(&request(dir.path())).expect_err("missing");
        assert!(matches!(err, AppError::CommandNotFound { .. }));
        assert!(CommandRenderer::parse("   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_renderer_captures_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let renderer = CommandRenderer::parse("false").expect("parse");
        let outcome = renderer.render(&request(dir.path())).expect("ran");
        assert_eq!(outcome.status, Some(1));

        let renderer = CommandRenderer::parse("true").expect("parse");
        let outcome = renderer.render(&request(dir.path())).expect("ran");
        assert!(outcome.success());
        assert!(outcome.drew());
    }
}
