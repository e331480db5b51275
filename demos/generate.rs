//! Greedy Generation
//!
//! Loads a config from JSON (or uses the tiny preset), builds an untrained
//! model from its seed and extends a prompt of token ids. Useful for checking
//! context cropping and sampling plumbing end to end.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example generate -- --prompt 5,17,42 --tokens 20
//! cargo run --release --example generate -- --config model.json --temperature 0.8
//! cargo run --release --example generate -- --save-config model.json
//! ```

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use verso::{Config, LanguageModel};

#[derive(Parser)]
#[command(name = "generate", about = "Autoregressively extend a prompt of token ids")]
struct Args {
    /// JSON config to build the model from (defaults to the tiny preset)
    #[arg(long)]
    config: Option<String>,

    /// Write the config in use to this path and exit
    #[arg(long)]
    save_config: Option<String>,

    /// Vocabulary size for the tiny preset
    #[arg(long, default_value = "100")]
    vocab: usize,

    /// Comma-separated prompt ids
    #[arg(long, value_delimiter = ',', default_value = "1,2,3")]
    prompt: Vec<usize>,

    /// Tokens to generate
    #[arg(long, default_value = "16")]
    tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Sampling seed
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::tiny(args.vocab),
    };

    if let Some(path) = &args.save_config {
        config.save(path)?;
        println!("Wrote config to {}", path);
        return Ok(());
    }

    let mut model = LanguageModel::new(&config)?;
    model.eval();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let tokens = model.generate(&args.prompt, args.tokens, args.temperature, &mut rng)?;

    println!("prompt:    {:?}", args.prompt);
    println!("generated: {:?}", &tokens[args.prompt.len()..]);
    Ok(())
}
