use clap::Parser;
use quarry_context::text::{
    ChunkingConfig, DEFAULT_BOUNDARIES, DEFAULT_CHARS_PER_TOKEN, TextChunker,
};
use std::fs;
use std::io::{self, Read};

/// Preview how a document is cut into embedding chunks, as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Token budget of the target embedding model.
    #[arg(short = 't', long, default_value_t = 256)]
    max_tokens: usize,

    /// Characters assumed per token.
    #[arg(short, long, default_value_t = DEFAULT_CHARS_PER_TOKEN)]
    chars_per_token: usize,

    /// Fraction of each window shared with the next, between 0 and 0.5.
    #[arg(short, long, default_value_t = 0.15)]
    overlap: f32,

    /// Comma-separated list of regex patterns preferred as window boundaries.
    #[arg(short, long, value_delimiter = ',')]
    boundaries: Option<Vec<String>>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let patterns_owned: Vec<String> = match args.boundaries {
        Some(b) => b,
        None => DEFAULT_BOUNDARIES.iter().map(|&s| s.to_string()).collect(),
    };
    let patterns: Vec<&str> = patterns_owned.iter().map(|s| s.as_str()).collect();

    let config =
        ChunkingConfig::from_token_budget(args.max_tokens, args.chars_per_token, args.overlap);
    let chunker = TextChunker::with_boundaries(config, &patterns)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let chunks = chunker.chunk_with_line_tracking(&file_content);

    let json_output = serde_json::to_string_pretty(&chunks)?;
    println!("{}", json_output);

    Ok(())
}
