//! Traffic obfuscation for tunnel payloads.
//!
//! Every payload is wrapped in an envelope so that packet sizes and leading
//! bytes do not fingerprint the tunnel:
//!
//! ```text
//! [fake HTTP request head, optional][u32 BE length][payload][random padding]
//! ```
//!
//! The obfuscation parameters are mutated over time; decoding never depends on
//! them, so envelopes produced under any parameter generation decode.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ObfuscationConfig;
use crate::error::{CoreError, Result};

/// Largest payload a single envelope carries. Keeps the first length byte at
/// zero so it can never be mistaken for a mimicry head.
pub const MAX_PAYLOAD: usize = 0x00FF_FFFF;

const LENGTH_PREFIX: usize = 4;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const HTTP_METHODS: [&[u8]; 4] = [b"GET ", b"POST ", b"HEAD ", b"PUT "];

const MIMIC_PATHS: [&str; 6] = [
    "/",
    "/index.html",
    "/search?q=weather",
    "/static/app.js",
    "/favicon.ico",
    "/api/v1/feed",
];

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
];

/// Current obfuscation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ObfuscationProfile {
    /// Upper bound on padding bytes per envelope
    pub max_padding: usize,
    /// Chance of adding a fake HTTP request head
    pub mimicry_probability: f64,
    /// Upper bound on the send delay
    pub max_jitter_ms: u64,
    /// Number of mutations applied so far
    pub generation: u64,
}

impl ObfuscationProfile {
    fn from_bounds(bounds: &ObfuscationConfig) -> Self {
        Self {
            max_padding: bounds.max_padding,
            mimicry_probability: bounds.mimicry_probability,
            max_jitter_ms: bounds.max_jitter_ms,
            generation: 0,
        }
    }
}

/// Applies and removes the obfuscation layer
pub struct Obfuscator {
    bounds: ObfuscationConfig,
    mimic_domain: String,
    profile: RwLock<ObfuscationProfile>,
}

impl Obfuscator {
    /// Create an obfuscator whose initial parameters are the configured bounds
    pub fn new<S: Into<String>>(bounds: ObfuscationConfig, mimic_domain: S) -> Self {
        let profile = ObfuscationProfile::from_bounds(&bounds);
        let mimic_domain = mimic_domain.into();
        info!(
            mimic_domain = %mimic_domain,
            max_padding = profile.max_padding,
            "Traffic obfuscator initialized"
        );

        Self {
            bounds,
            mimic_domain,
            profile: RwLock::new(profile),
        }
    }

    /// Snapshot of the current parameters
    pub async fn profile(&self) -> ObfuscationProfile {
        self.profile.read().await.clone()
    }

    /// Wrap outgoing data in an envelope, then wait a random jitter
    pub async fn obfuscate_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        let profile = self.profile().await;
        let (envelope, jitter_ms) = self.build_envelope(&profile, data)?;

        if jitter_ms > 0 {
            sleep(Duration::from_millis(jitter_ms)).await;
        }

        Ok(envelope)
    }

    /// Remove the obfuscation layer from incoming data
    pub fn deobfuscate_data(&self, data: &[u8]) -> Result<Vec<u8>> {
        decode_envelope(data).map(<[u8]>::to_vec)
    }

    fn build_envelope(&self, profile: &ObfuscationProfile, data: &[u8]) -> Result<(Vec<u8>, u64)> {
        if data.len() > MAX_PAYLOAD {
            return Err(CoreError::obfuscation(format!(
                "Payload of {} bytes exceeds envelope limit of {} bytes",
                data.len(),
                MAX_PAYLOAD
            )));
        }

        let mut rng = rand::thread_rng();
        let padding = rng.gen_range(0..=profile.max_padding);
        let mut envelope = Vec::with_capacity(data.len() + LENGTH_PREFIX + padding + 160);

        if rng.gen_bool(profile.mimicry_probability.clamp(0.0, 1.0)) {
            let path = MIMIC_PATHS.choose(&mut rng).copied().unwrap_or("/");
            let agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
            envelope.extend_from_slice(
                format!(
                    "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\n\r\n",
                    path, self.mimic_domain, agent
                )
                .as_bytes(),
            );
        }

        envelope.extend_from_slice(&(data.len() as u32).to_be_bytes());
        envelope.extend_from_slice(data);
        envelope.extend((0..padding).map(|_| rng.gen::<u8>()));

        let jitter_ms = rng.gen_range(0..=profile.max_jitter_ms);
        Ok((envelope, jitter_ms))
    }

    /// Draw new parameters within the configured bounds
    pub async fn mutate(&self) -> ObfuscationProfile {
        let next = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..=self.bounds.max_padding),
                rng.gen_range(0.0..=self.bounds.mimicry_probability.clamp(0.0, 1.0)),
                rng.gen_range(0..=self.bounds.max_jitter_ms),
            )
        };

        let mut profile = self.profile.write().await;
        profile.max_padding = next.0;
        profile.mimicry_probability = next.1;
        profile.max_jitter_ms = next.2;
        profile.generation += 1;

        debug!(
            generation = profile.generation,
            max_padding = profile.max_padding,
            mimicry_probability = profile.mimicry_probability,
            max_jitter_ms = profile.max_jitter_ms,
            "Obfuscation parameters mutated"
        );

        profile.clone()
    }

    /// Mutate parameters every `interval` until `shutdown` flips to true
    pub async fn run_mutation_cycle(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if interval.is_zero() {
            warn!("Mutation interval is zero, dynamic mutation disabled");
            return;
        }

        info!("Starting dynamic mutation cycle every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.mutate().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Mutation cycle stopped");
    }
}

/// Borrow the payload out of an envelope
pub fn decode_envelope(data: &[u8]) -> Result<&[u8]> {
    let body = strip_mimicry(data)?;

    if body.len() < LENGTH_PREFIX {
        return Err(CoreError::obfuscation(format!(
            "Envelope too short: {} bytes",
            body.len()
        )));
    }

    let (prefix, rest) = body.split_at(LENGTH_PREFIX);
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    if len > MAX_PAYLOAD {
        return Err(CoreError::obfuscation(format!(
            "Envelope length {} exceeds limit",
            len
        )));
    }

    if rest.len() < len {
        return Err(CoreError::obfuscation(format!(
            "Truncated envelope: expected {} payload bytes, got {}",
            len,
            rest.len()
        )));
    }

    Ok(&rest[..len])
}

fn strip_mimicry(data: &[u8]) -> Result<&[u8]> {
    if !HTTP_METHODS.iter().any(|method| data.starts_with(method)) {
        return Ok(data);
    }

    data.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
        .map(|pos| &data[pos + HEAD_TERMINATOR.len()..])
        .ok_or_else(|| CoreError::obfuscation("Unterminated mimicry header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(mimicry_probability: f64) -> ObfuscationConfig {
        ObfuscationConfig {
            max_padding: 15,
            mimicry_probability,
            max_jitter_ms: 0,
            mutation_interval_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_obfuscate_and_deobfuscate() {
        let obfuscator = Obfuscator::new(bounds(0.5), "www.example.com");
        let original = b"Hello, HezarDastan!";

        for _ in 0..64 {
            let obfuscated = obfuscator.obfuscate_data(original).await.unwrap();
            assert!(obfuscated.len() >= original.len() + LENGTH_PREFIX);
            assert_eq!(obfuscator.deobfuscate_data(&obfuscated).unwrap(), original);
        }
    }

    #[tokio::test]
    async fn test_mimicry_head_uses_mimic_domain() {
        let obfuscator = Obfuscator::new(bounds(1.0), "cdn.example.net");
        let obfuscated = obfuscator.obfuscate_data(b"data").await.unwrap();

        assert!(obfuscated.starts_with(b"GET "));
        let text = String::from_utf8_lossy(&obfuscated);
        assert!(text.contains("Host: cdn.example.net\r\n"));
        assert_eq!(obfuscator.deobfuscate_data(&obfuscated).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_no_mimicry_starts_with_length() {
        let obfuscator = Obfuscator::new(bounds(0.0), "www.example.com");
        let obfuscated = obfuscator.obfuscate_data(b"abc").await.unwrap();
        assert_eq!(&obfuscated[..LENGTH_PREFIX], &3u32.to_be_bytes());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let obfuscator = Obfuscator::new(bounds(0.3), "www.example.com");
        let obfuscated = obfuscator.obfuscate_data(b"").await.unwrap();
        assert!(obfuscator.deobfuscate_data(&obfuscated).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_envelopes_are_rejected() {
        assert!(decode_envelope(b"").is_err());
        assert!(decode_envelope(&[0, 0]).is_err());
        assert!(decode_envelope(&[0, 0, 0, 5, b'a', b'b']).is_err());
        assert!(decode_envelope(b"GET / HTTP/1.1\r\nHost: x\r\n").is_err());
    }

    #[test]
    fn test_padding_is_ignored() {
        let envelope = [0, 0, 0, 2, b'h', b'i', 0xde, 0xad, 0xbe, 0xef];
        assert_eq!(decode_envelope(&envelope).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let obfuscator = Obfuscator::new(bounds(0.0), "www.example.com");
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            obfuscator.obfuscate_data(&payload).await,
            Err(CoreError::Obfuscation(_))
        ));
    }

    #[tokio::test]
    async fn test_mutation_stays_within_bounds() {
        let obfuscator = Obfuscator::new(bounds(0.4), "www.example.com");
        let before = obfuscator.obfuscate_data(b"across generations").await.unwrap();

        for expected_generation in 1..=20 {
            let profile = obfuscator.mutate().await;
            assert_eq!(profile.generation, expected_generation);
            assert!(profile.max_padding <= 15);
            assert!((0.0..=0.4).contains(&profile.mimicry_probability));
            assert_eq!(profile.max_jitter_ms, 0);
        }

        assert_eq!(
            obfuscator.deobfuscate_data(&before).unwrap(),
            b"across generations"
        );
    }

    #[tokio::test]
    async fn test_mutation_cycle_stops_on_shutdown() {
        let obfuscator = std::sync::Arc::new(Obfuscator::new(bounds(0.3), "www.example.com"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cycle = {
            let obfuscator = obfuscator.clone();
            tokio::spawn(async move {
                obfuscator
                    .run_mutation_cycle(Duration::from_millis(10), shutdown_rx)
                    .await;
            })
        };

        sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), cycle)
            .await
            .expect("mutation cycle did not stop")
            .unwrap();
        assert!(obfuscator.profile().await.generation > 0);
    }
}
