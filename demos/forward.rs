//! Forward Pass Walkthrough
//!
//! Builds a model from command-line hyper-parameters, runs one forward pass
//! over a random padded batch and reports shapes, loss, perplexity and a
//! summary of every layer's attention weights.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example forward
//! cargo run --release --example forward -- --attention performer --seq-len 32
//! RUST_LOG=debug cargo run --release --example forward -- --layers 4 --heads 8 --d-model 64
//! ```

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use verso::{AttentionKind, Config, LanguageModel, LmBatch};

#[derive(Parser)]
#[command(name = "forward", about = "Run one forward pass and inspect the outputs")]
struct Args {
    /// Vocabulary size (id 0 is padding)
    #[arg(long, default_value = "100")]
    vocab: usize,

    /// Hidden width
    #[arg(long, default_value = "32")]
    d_model: usize,

    /// Decoder layers
    #[arg(long, default_value = "2")]
    layers: usize,

    /// Attention heads per layer
    #[arg(long, default_value = "4")]
    heads: usize,

    /// Feed-forward hidden width
    #[arg(long, default_value = "64")]
    d_ff: usize,

    /// Sequences in the batch
    #[arg(long, default_value = "2")]
    batch: usize,

    /// Tokens per sequence
    #[arg(long, default_value = "8")]
    seq_len: usize,

    /// Attention implementation: default | standard | performer
    #[arg(long, default_value = "default")]
    attention: AttentionKind,

    /// Random feature count for the performer kernel
    #[arg(long)]
    features: Option<usize>,

    /// Initialisation and data seed
    #[arg(long, default_value = "58")]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let attention = match args.attention {
        AttentionKind::Performer { .. } => AttentionKind::Performer {
            features: args.features,
        },
        other => other,
    };
    let config = Config {
        d_model: args.d_model,
        n_layers: args.layers,
        n_heads: args.heads,
        d_ff: args.d_ff,
        max_seq_len: args.seq_len.max(Config::tiny(args.vocab).max_seq_len),
        ..Config::tiny(args.vocab)
    }
    .with_attention(attention)
    .with_seed(args.seed);

    println!("\n{}", "=".repeat(70));
    println!("  Forward Pass");
    println!("{}", "=".repeat(70));

    let mut model = LanguageModel::new(&config)?;
    model.eval();
    println!("\nConfig:");
    println!(
        "  vocab={} d_model={} layers={} heads={} d_ff={}",
        config.vocab_size, config.d_model, config.n_layers, config.n_heads, config.d_ff
    );
    println!("  attention={:?}", config.attention);
    let params = model.count_parameters();
    println!("  parameters={} ({:.2}M)", params, params as f32 / 1_000_000.0);

    // Random ids with a ragged tail of padding on every other row
    let mut rng = StdRng::seed_from_u64(args.seed);
    let inputs: Vec<Vec<usize>> = (0..args.batch)
        .map(|b| {
            let real = if b % 2 == 1 {
                args.seq_len.div_ceil(2)
            } else {
                args.seq_len
            };
            (0..args.seq_len)
                .map(|t| {
                    if t < real {
                        rng.random_range(1..config.vocab_size)
                    } else {
                        config.pad_id
                    }
                })
                .collect()
        })
        .collect();

    println!("\n{}", "─".repeat(70));
    println!("Inputs");
    println!("{}", "─".repeat(70));
    for row in &inputs {
        println!("  {:?}", row);
    }

    let (logits, weights) = model.forward(&inputs, &mut rng)?;
    let metrics = model.step(&LmBatch::from_inputs(inputs.clone()), &mut rng)?;

    println!("\n{}", "─".repeat(70));
    println!("Outputs");
    println!("{}", "─".repeat(70));
    println!("  logits shape: {:?}", logits.shape);
    println!("  loss:         {:.4}", metrics.loss);
    println!(
        "  perplexity:   {:.2} (uniform guessing ≈ {})",
        metrics.perplexity, config.vocab_size
    );

    println!("\n{:<8} {:<18} {:<12} {:<12}", "Layer", "Shape", "Max weight", "Row sum[0]");
    println!("{}", "-".repeat(70));
    for (i, w) in weights.iter().enumerate() {
        let max = w.data.iter().fold(0.0f32, |a, &b| a.max(b));
        let first_row: f32 = w.row(0).iter().sum();
        println!(
            "{:<8} {:<18} {:<12.4} {:<12.4}",
            i,
            format!("{:?}", w.shape),
            max,
            first_row
        );
    }

    Ok(())
}
