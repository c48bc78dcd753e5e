use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::time::Duration;

/// Exponential inter-arrival times of a Poisson process, used to pace demo peers.
pub struct Poisson<R: Rng + ?Sized> {
    pub rng: Box<R>,
    pub rate: f64,
}

impl Poisson<SmallRng> {
    pub fn new(rate: f64, seed: &[u8; 32]) -> Self {
        Self {
            rng: Box::new(SmallRng::from_seed(*seed)),
            rate,
        }
    }

    /// Function that derives the seed from a peer name, so each peer gets its own stream.
    pub fn for_peer(rate: f64, peer_name: &str) -> Self {
        let mut seed = [0u8; 32];
        for (i, byte) in peer_name.bytes().enumerate() {
            seed[i % 32] ^= byte.rotate_left((i / 32) as u32);
        }
        Self::new(rate, &seed)
    }
}

impl<R: Rng + ?Sized> Poisson<R> {
    /// Time in seconds until the next event.
    pub fn time_for_next_event(&mut self) -> f64 {
        -(1.0f64 - self.rng.random::<f64>()).ln() / self.rate
    }

    pub fn next_delay(&mut self) -> Duration {
        Duration::from_secs_f64(self.time_for_next_event())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_delays() {
        let mut first = Poisson::for_peer(2.0, "producer");
        let mut second = Poisson::for_peer(2.0, "producer");

        for _ in 0..10 {
            assert_eq!(first.time_for_next_event(), second.time_for_next_event());
        }
    }

    #[test]
    fn delays_are_non_negative_and_finite() {
        let mut poisson = Poisson::for_peer(4.0, "consumer");

        for _ in 0..1000 {
            let delay = poisson.time_for_next_event();
            assert!(delay >= 0.0 && delay.is_finite());
        }
    }
}
