use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::rc::Rc;
use verso::{
    cross_entropy, perplexity, shifted_cross_entropy, AttentionKind, Config, Error, LanguageModel,
    Tensor,
};

const KINDS: [AttentionKind; 2] = [
    AttentionKind::Standard,
    AttentionKind::Performer { features: None },
];

fn eval_model(config: &Config) -> LanguageModel {
    let mut model = LanguageModel::new(config).unwrap();
    model.eval();
    model
}

/// Trailing padding on row 0, leading padding on row 1
fn padded_batch() -> Vec<Vec<usize>> {
    vec![vec![11, 42, 7, 19, 3, 0, 0, 0], vec![0, 0, 5, 8, 13, 21, 34, 55]]
}

#[test]
fn test_shape_contract_for_every_attention_kind() {
    for kind in KINDS {
        let config = Config::tiny(100).with_attention(kind);
        assert_eq!(
            (config.d_model, config.n_heads, config.n_layers, config.d_ff),
            (32, 4, 2, 64)
        );
        let model = eval_model(&config);
        let mut rng = StdRng::seed_from_u64(0);
        let ids: Vec<Vec<usize>> = (0..2)
            .map(|_| (0..8).map(|_| rng.random_range(1..100)).collect())
            .collect();

        let (logits, weights) = model.forward(&ids, &mut rng).unwrap();
        assert_eq!(logits.shape, vec![2, 8, 100], "{:?}", kind);
        assert_eq!(weights.len(), 2);
        for w in &weights {
            assert_eq!(w.shape, vec![2, 4, 8, 8], "{:?}", kind);
        }
    }
}

#[test]
fn test_attention_rows_sum_to_one_except_pad_queries() {
    let ids = padded_batch();
    for kind in KINDS {
        let model = eval_model(&Config::tiny(100).with_attention(kind));
        let mut rng = StdRng::seed_from_u64(1);
        let (_, weights) = model.forward(&ids, &mut rng).unwrap();

        for w in &weights {
            for b in 0..2 {
                for h in 0..4 {
                    for i in 0..8 {
                        if ids[b][i] == 0 {
                            continue;
                        }
                        let row = w.row(((b * 4) + h) * 8 + i);
                        let sum: f32 = row.iter().sum();
                        assert!(
                            (sum - 1.0).abs() < 1e-4,
                            "{:?}: b={} h={} i={} sums to {}",
                            kind,
                            b,
                            h,
                            i,
                            sum
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn test_future_keys_get_exactly_zero_weight() {
    for kind in KINDS {
        let model = eval_model(&Config::tiny(100).with_attention(kind));
        let mut rng = StdRng::seed_from_u64(2);
        let (_, weights) = model.forward(&padded_batch(), &mut rng).unwrap();

        for w in &weights {
            for bh in 0..8 {
                for i in 0..8 {
                    let row = w.row(bh * 8 + i);
                    for (j, &weight) in row.iter().enumerate().skip(i + 1) {
                        assert_eq!(weight, 0.0, "{:?}: query {} key {}", kind, i, j);
                    }
                }
            }
        }
    }
}

#[test]
fn test_perturbing_a_future_token_leaves_earlier_logits_unchanged() {
    for kind in KINDS {
        let model = eval_model(&Config::tiny(100).with_attention(kind));
        let original = vec![vec![4, 8, 15, 16, 23, 42]];
        let mut perturbed = original.clone();
        perturbed[0][4] = 99;

        let mut rng = StdRng::seed_from_u64(3);
        let (a, _) = model.forward(&original, &mut rng).unwrap();
        let (b, _) = model.forward(&perturbed, &mut rng).unwrap();

        for t in 0..4 {
            assert_eq!(a.row(t), b.row(t), "{:?}: position {} leaked", kind, t);
        }
        assert_ne!(a.row(4), b.row(4));
    }
}

#[test]
fn test_pad_keys_are_never_attended() {
    let ids = padded_batch();
    for kind in KINDS {
        let model = eval_model(&Config::tiny(100).with_attention(kind));
        let mut rng = StdRng::seed_from_u64(4);
        let (_, weights) = model.forward(&ids, &mut rng).unwrap();

        for w in &weights {
            for (b, row_ids) in ids.iter().enumerate() {
                for (t, _) in row_ids.iter().enumerate().filter(|&(_, &id)| id == 0) {
                    for h in 0..4 {
                        for i in 0..8 {
                            let weight = w.row(((b * 4) + h) * 8 + i)[t];
                            assert_eq!(weight, 0.0, "{:?}: b={} query {} key {}", kind, b, i, t);
                        }
                    }
                }
            }
        }
    }
}

/// Eval-mode Performer model whose heads are `d_model / n_heads` wide
fn wide_performer(d_model: usize, n_heads: usize) -> LanguageModel {
    let config = Config {
        d_model,
        n_heads,
        d_ff: 2 * d_model,
        ..Config::tiny(100)
    }
    .with_attention(AttentionKind::Performer { features: None });
    eval_model(&config)
}

#[test]
fn test_wide_performer_heads_stay_normalised() {
    let ids = vec![vec![11, 42, 7, 19, 3, 5, 6, 8], vec![0, 0, 5, 8, 13, 21, 34, 55]];
    for (d_model, n_heads) in [(256, 2), (256, 1)] {
        let model = wide_performer(d_model, n_heads);
        let mut rng = StdRng::seed_from_u64(12);
        let (logits, weights) = model.forward(&ids, &mut rng).unwrap();
        assert!(logits.data.iter().all(|v| v.is_finite()));

        for w in &weights {
            for b in 0..2 {
                for h in 0..n_heads {
                    for i in (0..8).filter(|&i| ids[b][i] != 0) {
                        let row = w.row(((b * n_heads) + h) * 8 + i);
                        let sum: f32 = row.iter().sum();
                        assert!(
                            (sum - 1.0).abs() < 1e-4,
                            "d_k={}: b={} h={} i={} sums to {}",
                            d_model / n_heads,
                            b,
                            h,
                            i,
                            sum
                        );
                        for (j, &weight) in row.iter().enumerate() {
                            if j > i || ids[b][j] == 0 {
                                assert_eq!(weight, 0.0);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_wide_performer_heads_do_not_leak_future_tokens() {
    let model = wide_performer(256, 2);
    let original = vec![vec![4, 8, 15, 16, 23, 42]];
    let mut perturbed = original.clone();
    perturbed[0][4] = 99;

    let mut rng = StdRng::seed_from_u64(13);
    let (a, _) = model.forward(&original, &mut rng).unwrap();
    let (b, _) = model.forward(&perturbed, &mut rng).unwrap();
    for t in 0..4 {
        assert_eq!(a.row(t), b.row(t), "position {} leaked", t);
    }
    assert_ne!(a.row(4), b.row(4));
}

#[test]
fn test_output_head_aliases_embedding_table() {
    let model = eval_model(&Config::tiny(50));
    let tied = model.tied_weight();
    assert!(Rc::ptr_eq(&tied, &model.gpt.decoder.embedding.share()));
    assert!(Rc::ptr_eq(&tied, model.head.weight()));

    let mut rng = StdRng::seed_from_u64(5);
    let ids = vec![vec![1, 2, 3]];
    let (before, _) = model.forward(&ids, &mut rng).unwrap();

    // Zero one vocabulary row through the embedding's mutation point
    {
        let mut weight = model.embedding_weight_mut();
        let d = weight.shape[1];
        weight.data[7 * d..8 * d].iter_mut().for_each(|w| *w = 0.0);
    }
    assert!(tied.borrow().row(7).iter().all(|&w| w == 0.0));

    let (after, _) = model.forward(&ids, &mut rng).unwrap();
    for t in 0..3 {
        assert_eq!(after.row(t)[7], 0.0);
        assert_ne!(before.row(t)[7], 0.0);
    }
}

#[test]
fn test_forward_is_bit_identical_with_dropout_disabled() {
    for kind in KINDS {
        // Training mode, but every probability zero
        let config = Config::tiny(100).with_dropout(0.0).with_attention(kind);
        let model = LanguageModel::new(&config).unwrap();
        assert!(model.is_training());

        let ids = padded_batch();
        let (a, wa) = model.forward(&ids, &mut StdRng::seed_from_u64(6)).unwrap();
        let (b, wb) = model.forward(&ids, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(wa, wb);
    }
}

#[test]
fn test_dropout_makes_training_forward_stochastic() {
    let model = LanguageModel::new(&Config::tiny(100).with_dropout(0.5)).unwrap();
    let ids = vec![vec![1, 2, 3, 4]];
    let (a, _) = model.forward(&ids, &mut StdRng::seed_from_u64(6)).unwrap();
    let (b, _) = model.forward(&ids, &mut StdRng::seed_from_u64(7)).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_perplexity_near_one_for_argmax_labels() {
    let (batch, seq, vocab) = (2, 6, 20);
    let mut rng = StdRng::seed_from_u64(8);
    let labels: Vec<Vec<usize>> = (0..batch)
        .map(|_| (0..seq).map(|_| rng.random_range(0..vocab)).collect())
        .collect();

    // Position t puts all its mass on label t+1
    let mut data = vec![0.0; batch * seq * vocab];
    for b in 0..batch {
        for t in 0..seq - 1 {
            data[(b * seq + t) * vocab + labels[b][t + 1]] = 40.0;
        }
    }
    let logits = Tensor::new(data, vec![batch, seq, vocab]);

    let loss = shifted_cross_entropy(&logits, &labels, None).unwrap();
    assert!(loss < 1e-4);
    assert!((perplexity(loss) - 1.0).abs() < 1e-3);
}

#[test]
fn test_perplexity_near_vocab_for_uniform_logits() {
    let (n, vocab) = (2000, 50);
    let mut rng = StdRng::seed_from_u64(9);
    let data = (0..n * vocab)
        .map(|_| rng.random::<f32>() * 0.01)
        .collect();
    let targets: Vec<usize> = (0..n).map(|_| rng.random_range(0..vocab)).collect();

    let loss = cross_entropy(&Tensor::new(data, vec![n, vocab]), &targets, None).unwrap();
    assert!((loss - (vocab as f32).ln()).abs() < 0.01);
    assert!((perplexity(loss) - vocab as f32).abs() < 0.5);
}

#[test]
fn test_untrained_model_is_close_to_uniform() {
    let model = eval_model(&Config::tiny(100).with_attention(AttentionKind::Performer {
        features: Some(32),
    }));
    let mut rng = StdRng::seed_from_u64(10);
    let batch = verso::LmBatch::from_inputs(padded_batch());
    let metrics = model.step(&batch, &mut rng).unwrap();
    assert!(metrics.loss.is_finite());
    assert!(metrics.perplexity > 1.0);
}

#[test]
fn test_configuration_errors() {
    let bad_heads = Config {
        n_heads: 5,
        ..Config::tiny(100)
    };
    assert!(matches!(
        LanguageModel::new(&bad_heads),
        Err(Error::HeadsDoNotDivide { .. })
    ));

    let too_long = Config {
        max_seq_len: 5000,
        ..Config::tiny(100)
    };
    assert!(matches!(
        LanguageModel::new(&too_long),
        Err(Error::PositionalCapacity { .. })
    ));

    assert!("linformer".parse::<AttentionKind>().unwrap_err().is_config());
}

#[test]
fn test_shape_errors_at_forward_time() {
    let model = eval_model(&Config::tiny(100));
    let mut rng = StdRng::seed_from_u64(11);

    let ragged = model.forward(&[vec![1, 2, 3], vec![4, 5]], &mut rng).unwrap_err();
    assert!(matches!(ragged, Error::RaggedBatch { row: 1, .. }));

    let oov = model.forward(&[vec![1, 100]], &mut rng).unwrap_err();
    assert!(matches!(oov, Error::TokenOutOfRange { id: 100, .. }));

    let long = model.forward(&[vec![1; 65]], &mut rng).unwrap_err();
    assert!(long.is_shape());

    assert!(matches!(
        model.forward(&[], &mut rng),
        Err(Error::EmptyBatch)
    ));
}
