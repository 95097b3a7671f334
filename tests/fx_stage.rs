//! # Fx Stage Scenarios
//!
//! Feeds seeded, sorted input buckets through the Fx evaluator and
//! verifies the output streams against an independent reference
//! implementation (bit-string packing + blake3, no shared code with the
//! crate's packers):
//!
//! 1. Exact y'/meta match for concatenating tables (source 1, 2)
//! 2. Exact y'/meta match for hash-slicing tables (source 3)
//! 3. The final stage drops meta and the extra y bits
//! 4. Conservation and bucket classification of every output entry
//! 5. Chunk-size and thread-count invariance, including a trailing chunk
//!    that is not a multiple of the chunk size

use std::path::Path;

use harrow::{FxInput, FxOutput, FxStage, Pair, PlotConfig, Plotter, TableId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const K: u32 = 12;
const K_EXTRA: u32 = 6;
const BUCKETS: u32 = 8;
const LOG_BUCKETS: u32 = 3;

fn meta_in_widths(source: TableId) -> (u32, u32) {
    match source.meta_multiplier() {
        0 => (0, 0),
        1 => (K, 0),
        2 => (2 * K, 0),
        3 => (2 * K, K),
        4 => (2 * K, 2 * K),
        _ => unreachable!(),
    }
}

fn out_multiplier(source: TableId) -> u32 {
    source.next().unwrap().meta_multiplier()
}

/// Seeded sorted input bucket with valid adjacent-ish pairs.
struct Bucket {
    bucket: u32,
    ys: Vec<u64>,
    meta_a: Vec<u64>,
    meta_b: Vec<u64>,
    pairs: Vec<Pair>,
}

fn make_bucket(source: TableId, bucket: u32, entries: usize, seed: u64) -> Bucket {
    let (a_bits, b_bits) = meta_in_widths(source);
    let mut rng = StdRng::seed_from_u64(seed);

    let low_bits = K + K_EXTRA - LOG_BUCKETS;
    let mut ys: Vec<u64> = (0..entries)
        .map(|_| ((bucket as u64) << low_bits) | rng.gen_range(0..1u64 << low_bits))
        .collect();
    ys.sort_unstable();

    let mask = |bits: u32| if bits == 0 { 0 } else { u64::MAX >> (64 - bits) };
    let meta_a: Vec<u64> = (0..entries).map(|_| rng.gen::<u64>() & mask(a_bits)).collect();
    let meta_b: Vec<u64> = (0..entries).map(|_| rng.gen::<u64>() & mask(b_bits)).collect();

    let pairs: Vec<Pair> = (0..entries as u32 - 2)
        .map(|left| Pair { left, right_delta: 1 + (left % 2) as u16 })
        .collect();

    Bucket { bucket, ys, meta_a, meta_b, pairs }
}

/// Independent recomputation: packs the hash input as a bit string,
/// hashes with blake3, and slices the output as bit strings.
fn reference_eval(source: TableId, input: &Bucket, pair: Pair) -> (u64, u32, u64, u64) {
    let (a_bits, b_bits) = meta_in_widths(source);
    let out_mult = out_multiplier(source);
    let left = pair.left as usize;
    let right = left + pair.right_delta as usize;

    let mut bit_string = String::new();
    let mut push = |value: u64, bits: u32| {
        bit_string.push_str(&format!("{value:0width$b}", width = bits as usize));
    };
    push(input.ys[left], K + K_EXTRA);
    if a_bits > 0 {
        push(input.meta_a[left], a_bits);
    }
    if b_bits > 0 {
        push(input.meta_b[left], b_bits);
    }
    if a_bits > 0 {
        push(input.meta_a[right], a_bits);
    }
    if b_bits > 0 {
        push(input.meta_b[right], b_bits);
    }
    while bit_string.len() % 8 != 0 {
        bit_string.push('0');
    }
    let bytes: Vec<u8> = bit_string
        .as_bytes()
        .chunks(8)
        .map(|chunk| chunk.iter().fold(0u8, |acc, &b| (acc << 1) | (b - b'0')))
        .collect();

    let hash = blake3::hash(&bytes);
    let hash_bits: String = hash
        .as_bytes()
        .iter()
        .map(|byte| format!("{byte:08b}"))
        .collect();
    let slice = |start: usize, bits: usize| -> u64 {
        u64::from_str_radix(&hash_bits[start..start + bits], 2).unwrap()
    };

    let y_out_bits = if out_mult == 0 { K } else { K + K_EXTRA } as usize;
    let y = slice(0, y_out_bits);
    let bucket = (y >> (y_out_bits as u32 - LOG_BUCKETS)) as u32;

    let meta_offset = (K + K_EXTRA) as usize;
    let (meta_a, meta_b) = match (out_mult, source.meta_multiplier()) {
        (2, 1) => ((input.meta_a[left] << K) | input.meta_a[right], 0),
        (4, 2) => (input.meta_a[left], input.meta_a[right]),
        (0, _) => (0, 0),
        (out, _) => {
            let a = slice(meta_offset, 2 * K as usize);
            let b = if out > 2 {
                slice(meta_offset + 2 * K as usize, ((out - 2) * K) as usize)
            } else {
                0
            };
            (a, b)
        }
    };

    (y, bucket, meta_a, meta_b)
}

fn make_plotter(dir: &Path) -> Plotter {
    Plotter::create(PlotConfig {
        plot_id: [9u8; 32],
        k: K,
        bucket_count: BUCKETS,
        thread_count: 2,
        arena_size: 8 * 1024 * 1024,
        use_direct_io: false,
        work_dir: dir.to_path_buf(),
    })
    .unwrap()
}

/// Runs one stage over the input bucket and decodes all produced streams
/// into `(bucket, y, metaA, metaB)` rows.
fn run_stage(
    source: TableId,
    threads: u32,
    chunk_entries: usize,
    input: &Bucket,
) -> Vec<(u64, u64, u64, u64)> {
    let dir = tempdir().unwrap();
    let plotter = make_plotter(dir.path());
    let stage = FxStage::new(plotter.queue(), source, K, threads, chunk_entries);

    stage
        .run_bucket(&FxInput {
            bucket: input.bucket,
            ys: &input.ys,
            meta_a: &input.meta_a,
            meta_b: &input.meta_b,
            pairs: &input.pairs,
        })
        .unwrap();
    let FxOutput { y, meta_a, meta_b } = stage.finish();

    let shape_out_mult = out_multiplier(source);
    let y_bits = if shape_out_mult == 0 { K } else { K + K_EXTRA };
    let a_bits = if shape_out_mult >= 2 { 2 * K } else { 0 };
    let b_bits = match shape_out_mult {
        3 => K,
        4 => 2 * K,
        _ => 0,
    };

    let mut rows = Vec::new();
    for bucket in 0..BUCKETS {
        let ys = plotter.read_entries(&y, bucket, &[y_bits]).unwrap();
        let metas_a = meta_a
            .as_ref()
            .map(|m| plotter.read_entries(m, bucket, &[a_bits]).unwrap());
        let metas_b = meta_b
            .as_ref()
            .map(|m| plotter.read_entries(m, bucket, &[b_bits]).unwrap());

        for (i, &y_val) in ys.iter().enumerate() {
            let a_val = metas_a.as_ref().map_or(0, |v| v[i]);
            let b_val = metas_b.as_ref().map_or(0, |v| v[i]);
            rows.push((bucket as u64, y_val, a_val, b_val));
        }
    }
    rows.sort_unstable();
    rows
}

fn reference_rows(source: TableId, input: &Bucket) -> Vec<(u64, u64, u64, u64)> {
    let mut rows: Vec<(u64, u64, u64, u64)> = input
        .pairs
        .iter()
        .map(|&pair| {
            let (y, bucket, a, b) = reference_eval(source, input, pair);
            (bucket as u64, y, a, b)
        })
        .collect();
    rows.sort_unstable();
    rows
}

#[test]
fn concatenating_stage_matches_the_reference() {
    // Source table 1: meta' = xL || xR.
    let input = make_bucket(TableId::Table1, 0, 64, 0xF00D);
    let rows = run_stage(TableId::Table1, 1, 1024, &input);
    assert_eq!(rows, reference_rows(TableId::Table1, &input));
}

#[test]
fn pair_carrying_stage_matches_the_reference() {
    // Source table 2: meta' = (metaL, metaR) as two components.
    let input = make_bucket(TableId::Table2, 5, 48, 0xBEEF);
    let rows = run_stage(TableId::Table2, 2, 16, &input);
    assert_eq!(rows, reference_rows(TableId::Table2, &input));
}

#[test]
fn hash_slicing_stage_matches_the_reference() {
    // Source table 3: both output metas are hash slices.
    let input = make_bucket(TableId::Table3, 7, 40, 0xCAFE);
    let rows = run_stage(TableId::Table3, 2, 11, &input);
    assert_eq!(rows, reference_rows(TableId::Table3, &input));
}

#[test]
fn final_stage_drops_meta_and_extra_bits() {
    let input = make_bucket(TableId::Table6, 1, 32, 0x5EED);

    let dir = tempdir().unwrap();
    let plotter = make_plotter(dir.path());
    let stage = FxStage::new(plotter.queue(), TableId::Table6, K, 2, 16);
    stage
        .run_bucket(&FxInput {
            bucket: input.bucket,
            ys: &input.ys,
            meta_a: &input.meta_a,
            meta_b: &input.meta_b,
            pairs: &input.pairs,
        })
        .unwrap();
    let out = stage.finish();

    assert!(out.meta_a.is_none());
    assert!(out.meta_b.is_none());
    assert_eq!(out.y.total_entries(), input.pairs.len() as u64);

    for bucket in 0..BUCKETS {
        for y in plotter.read_entries(&out.y, bucket, &[K]).unwrap() {
            assert!(y < 1 << K);
            assert_eq!(y >> (K - LOG_BUCKETS), bucket as u64);
        }
    }
}

#[test]
fn output_is_invariant_across_threads_and_chunking() {
    let input = make_bucket(TableId::Table2, 3, 32, 0xABCD);

    // Chunk 7 leaves a trailing chunk of 30 % 7 = 2 entries; chunk 5
    // divides unevenly too. All runs must agree exactly.
    let baseline = run_stage(TableId::Table2, 1, 1024, &input);
    for (threads, chunk) in [(4u32, 7usize), (2, 5), (3, 30), (1, 1)] {
        let rows = run_stage(TableId::Table2, threads, chunk, &input);
        assert_eq!(rows, baseline, "T={} chunk={} diverged", threads, chunk);
    }
}

#[test]
fn every_output_entry_is_counted_and_classified() {
    let input = make_bucket(TableId::Table4, 2, 56, 0x1234);
    let rows = run_stage(TableId::Table4, 2, 13, &input);

    assert_eq!(rows.len(), input.pairs.len());
    for &(bucket, y, _, _) in &rows {
        assert_eq!(y >> (K + K_EXTRA - LOG_BUCKETS), bucket);
    }
}
