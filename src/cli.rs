use crate::errors::{AppError, Result};
use crate::matrix::ColumnLayout;
use crate::pileup::MalformedRecordPolicy;
use crate::region::SlopSpec;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};

#[derive(Debug, Clone, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct CliArgs {
    #[arg(short = 'i', long = "ibam", num_args = 1..)]
    ibam: Vec<String>,
    #[arg(short = 'b', long = "bed")]
    bed: Option<String>,
    #[arg(
        short = 's',
        long = "slop",
        num_args = 1..,
        allow_negative_numbers = true,
        default_values = ["0.05", "0.05"]
    )]
    slop: Vec<String>,
    #[arg(short = 'f', long = "fasta")]
    fasta: Option<String>,
    #[arg(long = "samtools", default_value = "samtools")]
    samtools: String,
    #[arg(long = "bedtools", default_value = "bedtools")]
    bedtools: String,
    #[arg(long = "interval-backend", default_value = "bedtools")]
    interval_backend: String,
    #[arg(short = 't', long = "tmpdir")]
    tmpdir: Option<String>,
    #[arg(short = 'd', long = "outdir")]
    outdir: Option<String>,
    #[arg(short = 'w', long = "nwinds", default_value = "1000")]
    nwinds: String,
    #[arg(short = 'm', long = "maxseq", default_value = "100")]
    maxseq: String,
    #[arg(long = "group_fun", default_value = "mean")]
    group_fun: String,
    #[arg(long = "rpm", action = ArgAction::SetTrue)]
    rpm: bool,
    #[arg(long = "replot", action = ArgAction::SetTrue)]
    replot: bool,
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    strict: bool,
    #[arg(long = "skip-malformed", action = ArgAction::SetTrue)]
    skip_malformed: bool,
    #[arg(long = "layout", default_value = "sample-major")]
    layout: String,
    #[arg(long = "names", num_args = 1..)]
    names: Vec<String>,
    #[arg(long = "renderer")]
    renderer: Option<String>,
    #[arg(long = "threads")]
    threads: Option<String>,
    #[arg(long = "progress", action = ArgAction::SetTrue)]
    progress: bool,
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    verbose: bool,
}

/// Which implementation sorts and merges the target regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalBackend {
    Bedtools,
    Native,
}

impl IntervalBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "bedtools" => Ok(Self::Bedtools),
            "native" => Ok(Self::Native),
            other => Err(AppError::InvalidValue {
                flag: "--interval-backend".to_string(),
                value: other.to_string(),
                reason: "expected \"bedtools\" or \"native\"".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphArgs {
    pub inputs: Vec<String>,
    pub bed: String,
    pub slop: SlopSpec,
    pub fasta: Option<String>,
    pub samtools: String,
    pub bedtools: String,
    pub interval_backend: IntervalBackend,
    pub tmpdir: Option<String>,
    pub outdir: Option<String>,
    pub nwinds: usize,
    pub maxseq: u64,
    pub group_fun: String,
    pub rpm: bool,
    pub replot: bool,
    pub strict: bool,
    pub malformed: MalformedRecordPolicy,
    pub layout: ColumnLayout,
    pub names: Vec<String>,
    pub renderer: Option<String>,
    pub threads: usize,
    pub progress: bool,
    pub verbose: bool,
}

impl Default for GraphArgs {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            bed: String::new(),
            slop: SlopSpec::default(),
            fasta: None,
            samtools: "samtools".to_string(),
            bedtools: "bedtools".to_string(),
            interval_backend: IntervalBackend::Bedtools,
            tmpdir: None,
            outdir: None,
            nwinds: 1000,
            maxseq: 100,
            group_fun: "mean".to_string(),
            rpm: false,
            replot: false,
            strict: false,
            malformed: MalformedRecordPolicy::AbortLine,
            layout: ColumnLayout::SampleMajor,
            names: Vec::new(),
            renderer: None,
            threads: 0,
            progress: false,
            verbose: false,
        }
    }
}

impl GraphArgs {
    pub fn inputs_from_stdin(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0] == "-"
    }

    pub fn validate(&self) -> Result<()> {
        if self.bed.is_empty() {
            return Err(AppError::MissingRequired {
                field: "--bed".to_string(),
            });
        }
        if self.inputs.is_empty() && !self.replot {
            return Err(AppError::MissingRequired {
                field: "--ibam".to_string(),
            });
        }
        if self.inputs_from_stdin() && self.bed == "-" {
            return Err(AppError::InvalidValue {
                flag: "--bed".to_string(),
                value: "-".to_string(),
                reason: "stdin passed to both --ibam and --bed".to_string(),
            });
        }
        if self.replot && self.tmpdir.is_none() {
            return Err(AppError::MissingRequired {
                field: "--tmpdir (cannot replot without a working directory)".to_string(),
            });
        }
        if self.nwinds == 0 {
            return Err(AppError::InvalidValue {
                flag: "--nwinds".to_string(),
                value: "0".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }
        if !self.names.is_empty()
            && !self.inputs_from_stdin()
            && self.names.len() != self.inputs.len()
        {
            return Err(AppError::InvalidValue {
                flag: "--names".to_string(),
                value: self.names.join(" "),
                reason: format!(
                    "got {} names for {} inputs",
                    self.names.len(),
                    self.inputs.len()
                ),
            });
        }
        Ok(())
    }
}

pub fn parse_from_env() -> Result<GraphArgs> {
    parse_args(std::env::args())
}

pub fn parse_args<I, S>(args: I) -> Result<GraphArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    if tokens.is_empty() {
        tokens.push("genome_graphs".to_string());
    }

    let normalized = normalize_legacy_tokens(tokens);
    let cli = CliArgs::try_parse_from(normalized).map_err(map_clap_error)?;

    let parsed = GraphArgs {
        inputs: cli.ibam,
        bed: cli.bed.unwrap_or_default(),
        slop: SlopSpec::parse(&cli.slop)?,
        fasta: cli.fasta,
        samtools: cli.samtools,
        bedtools: cli.bedtools,
        interval_backend: IntervalBackend::parse(&cli.interval_backend)?,
        tmpdir: cli.tmpdir,
        outdir: cli.outdir,
        nwinds: parse_usize("--nwinds", &cli.nwinds)?,
        maxseq: parse_u64("--maxseq", &cli.maxseq)?,
        group_fun: cli.group_fun,
        rpm: cli.rpm,
        replot: cli.replot,
        strict: cli.strict,
        malformed: if cli.skip_malformed {
            MalformedRecordPolicy::SkipRecord
        } else {
            MalformedRecordPolicy::AbortLine
        },
        layout: ColumnLayout::parse(&cli.layout)?,
        names: cli.names,
        renderer: cli.renderer,
        threads: cli
            .threads
            .as_deref()
            .map_or(Ok(0), |value| parse_usize("--threads", value))?,
        progress: cli.progress,
        verbose: cli.verbose,
    };

    parsed.validate()?;
    Ok(parsed)
}

fn normalize_legacy_tokens(tokens: Vec<String>) -> Vec<String> {
    tokens
        .into_iter()
        .map(|token| {
            if token == "-group_fun" || token == "--group-fun" {
                "--group_fun".to_string()
            } else if let Some(value) = token
                .strip_prefix("-group_fun=")
                .or_else(|| token.strip_prefix("--group-fun="))
            {
                format!("--group_fun={value}")
            } else if token == "--skip_malformed" {
                "--skip-malformed".to_string()
            } else {
                token
            }
        })
        .collect()
}

fn map_clap_error(error: clap::Error) -> AppError {
    let kind = error.kind();
    let rendered = error.to_string();
    match kind {
        ErrorKind::UnknownArgument => AppError::UnsupportedArgument {
            arg: first_quoted_token(&rendered).unwrap_or(rendered),
        },
        ErrorKind::TooFewValues | ErrorKind::WrongNumberOfValues | ErrorKind::InvalidValue => {
            AppError::MissingValue {
                flag: first_quoted_token(&rendered).unwrap_or_else(|| "argument".to_string()),
            }
        }
        _ => AppError::config(clap_error_message(&rendered)),
    }
}

fn first_quoted_token(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}

fn clap_error_message(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("error: "))
        .or_else(|| message.lines().next())
        .unwrap_or("failed to parse arguments")
        .to_string()
}

fn parse_usize(flag: &str, value: &str) -> Result<usize> {
    value.parse::<usize>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}

fn parse_u64(flag: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a non-negative integer".to_string(),
    })
}
