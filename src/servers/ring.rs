//! Consistent hash ring
//!
//! Ketama-style ring: every server contributes 160 points, four per MD5
//! digest of `"<server>-<i>"`. A key belongs to the first point at or
//! after its own hash, wrapping around at the end. Removing a server only
//! moves the keys that server owned.

/// Points contributed by each server.
const POINTS_PER_SERVER: usize = 160;

/// An immutable hash ring over server addresses.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Sorted (hash point, server index) pairs
    points: Box<[(u32, usize)]>,
    servers: Vec<String>,
}

impl HashRing {
    /// Builds a ring. Returns None if there are no servers.
    pub fn build<S: AsRef<str>>(servers: &[S]) -> Option<Self> {
        if servers.is_empty() {
            return None;
        }

        let mut points = Vec::with_capacity(servers.len() * POINTS_PER_SERVER);

        for (index, server) in servers.iter().enumerate() {
            for i in 0..POINTS_PER_SERVER / 4 {
                let digest = md5::compute(format!("{}-{}", server.as_ref(), i));
                for word in digest.0.chunks_exact(4) {
                    let hash = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    points.push((hash, index));
                }
            }
        }

        points.sort_unstable_by_key(|&(hash, _)| hash);

        Some(Self {
            points: points.into_boxed_slice(),
            servers: servers.iter().map(|s| s.as_ref().to_string()).collect(),
        })
    }

    /// Returns the server that owns `key`.
    pub fn get(&self, key: &str) -> &str {
        if self.servers.len() == 1 {
            return &self.servers[0];
        }
        let hash = key_hash(key.as_bytes());
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        &self.servers[self.points[idx].1]
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }
}

#[inline]
fn key_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key);
    u32::from_le_bytes([digest.0[0], digest.0[1], digest.0[2], digest.0[3]])
}
