/// Turns seed integers into a short URL-safe handle. Must be
/// deterministic: the same seeds always give the same handle.
pub trait HandleEncoder: Send + Sync {
    fn encode(&self, seeds: &[u64]) -> String;
}

const BASE62: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Positional encoding of each seed over a fixed alphabet, concatenated and
/// left-padded to a minimum length.
#[derive(Debug, Clone)]
pub struct AlphabetEncoder {
    alphabet: Vec<char>,
    min_length: usize,
}

impl Default for AlphabetEncoder {
    fn default() -> Self {
        Self::new(BASE62, 6)
    }
}

impl AlphabetEncoder {
    /// `alphabet` needs at least two distinct characters.
    pub fn new(alphabet: &str, min_length: usize) -> Self {
        let mut chars: Vec<char> = Vec::new();
        for c in alphabet.chars() {
            if !chars.contains(&c) {
                chars.push(c);
            }
        }
        if chars.len() < 2 {
            chars = BASE62.chars().collect();
        }
        Self {
            alphabet: chars,
            min_length,
        }
    }

    fn push_digits(&self, mut n: u64, out: &mut String) {
        let base = self.alphabet.len() as u64;
        let mut digits = Vec::new();
        loop {
            digits.push(self.alphabet[(n % base) as usize]);
            n /= base;
            if n == 0 {
                break;
            }
        }
        out.extend(digits.iter().rev());
    }
}

impl HandleEncoder for AlphabetEncoder {
    fn encode(&self, seeds: &[u64]) -> String {
        let mut body = String::new();
        for &seed in seeds {
            self.push_digits(seed, &mut body);
        }
        let width = body.chars().count();
        if width >= self.min_length {
            return body;
        }
        let mut padded: String = std::iter::repeat_n(self.alphabet[0], self.min_length - width).collect();
        padded.push_str(&body);
        padded
    }
}

/// `n` random seeds from the OS, each below 2^32 to keep handles short.
pub fn random_seeds(n: usize) -> Result<Vec<u64>, getrandom::Error> {
    let mut buf = vec![0u8; n * 4];
    getrandom::fill(&mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
        .collect())
}
