use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generate synthetic text of approximately `num_tokens` tokens.
///
/// Word-like runs of 3 to 8 lowercase letters approximate tokenizer output
/// closely enough for embedding workloads without pulling in a tokenizer.
pub fn generate_text(rng: &mut StdRng, num_tokens: u32) -> String {
    let words_needed = num_tokens.max(1) as usize;
    let mut words = Vec::with_capacity(words_needed);
    for _ in 0..words_needed {
        let length = rng.gen_range(3..=8);
        let word: String = (0..length)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        words.push(word);
    }
    words.join(" ")
}

/// Pre-generate all request payloads for a sweep point.
///
/// Deterministic for a given seed so that re-runs of a point issue requests
/// of identical shape.
pub fn generate_batches(
    seed: u64,
    chunk_size: u32,
    batch_size: u32,
    num_requests: usize,
) -> Vec<Vec<String>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..num_requests)
        .map(|_| {
            (0..batch_size)
                .map(|_| generate_text(&mut rng, chunk_size))
                .collect()
        })
        .collect()
}
