// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local device selection from hostname collisions.
//!
//! Every rank hashes its short hostname, the hashes are all-gathered, and a
//! rank's device index is the number of lower ranks on the same host.

use crate::error::{Error, Result};
use crate::process_group::ProcessGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub rank: usize,
    pub group_size: usize,
    pub local_device_index: usize,
}

/// Hostname up to (not including) the first `.`.
pub fn canonical_hostname(hostname: &str) -> &str {
    match hostname.find('.') {
        Some(i) => &hostname[..i],
        None => hostname,
    }
}

/// DJB2a over the canonical hostname: `h = h * 33 ^ c`, seeded with 5381.
pub fn host_fingerprint(hostname: &str) -> u64 {
    canonical_hostname(hostname)
        .bytes()
        .fold(5381u64, |h, c| ((h << 5).wrapping_add(h)) ^ u64::from(c))
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Number of ranks below `rank` whose fingerprint equals `rank`'s.
///
/// # Panics
///
/// If `rank >= fingerprints.len()`. [`discover`] checks this before calling.
pub fn local_device_index(fingerprints: &[u64], rank: usize) -> usize {
    let mine = fingerprints[rank];
    fingerprints[..rank].iter().filter(|&&f| f == mine).count()
}

/// Exchange fingerprints across the group and derive this rank's identity.
pub fn discover<P: ProcessGroup>(group: &P, hostname: &str) -> Result<ProcessIdentity> {
    let rank = group.rank();
    let group_size = group.size();
    if rank >= group_size {
        return Err(Error::InvalidRank {
            rank,
            size: group_size,
        });
    }

    let fingerprints = group.all_gather(host_fingerprint(hostname))?;
    if fingerprints.len() != group_size {
        return Err(Error::bootstrap(
            "all_gather",
            0,
            format!(
                "expected {} fingerprints, got {}",
                group_size,
                fingerprints.len()
            ),
        ));
    }

    let identity = ProcessIdentity {
        rank,
        group_size,
        local_device_index: local_device_index(&fingerprints, rank),
    };
    log::debug!(
        "[Rank {}] host {} -> local device {}",
        rank,
        canonical_hostname(hostname),
        identity.local_device_index
    );
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::LocalGroup;

    #[test]
    fn hostname_is_truncated_at_first_dot() {
        assert_eq!(canonical_hostname("gpu-07.rack3.example.com"), "gpu-07");
        assert_eq!(canonical_hostname("gpu-07"), "gpu-07");
        assert_eq!(canonical_hostname(".hidden"), "");
        assert_eq!(
            host_fingerprint("gpu-07.rack3"),
            host_fingerprint("gpu-07.rack9")
        );
        assert_ne!(host_fingerprint("gpu-07"), host_fingerprint("gpu-08"));
    }

    #[test]
    fn fingerprint_matches_djb2a() {
        assert_eq!(host_fingerprint(""), 5381);
        // 5381 * 33 ^ 'a'
        assert_eq!(host_fingerprint("a"), (5381 * 33) ^ 97);
    }

    #[test]
    fn distinct_hosts_all_use_device_zero() {
        let fps = [11, 22, 33, 44, 55];
        for rank in 0..fps.len() {
            assert_eq!(local_device_index(&fps, rank), 0);
        }
    }

    #[test]
    fn indices_count_up_within_each_host() {
        // ranks interleaved across three hosts
        let fps = [7, 9, 7, 3, 9, 7, 3];
        let indices: Vec<_> = (0..fps.len())
            .map(|r| local_device_index(&fps, r))
            .collect();
        assert_eq!(indices, vec![0, 0, 1, 0, 1, 2, 1]);

        // within a host the indices are 0..n in rank order, wherever the
        // other hosts' ranks are placed
        for host in [3, 7, 9] {
            let per_host: Vec<_> = (0..fps.len())
                .filter(|&r| fps[r] == host)
                .map(|r| indices[r])
                .collect();
            let expected: Vec<_> = (0..per_host.len()).collect();
            assert_eq!(per_host, expected);
        }
    }

    #[test]
    #[should_panic]
    fn rank_outside_the_fingerprints_panics() {
        local_device_index(&[1, 2], 2);
    }

    #[test]
    fn four_ranks_on_two_hosts() {
        let hosts = ["node-a.cluster", "node-b.cluster", "node-a", "node-b.other"];
        let world = LocalGroup::create_world(hosts.len());
        let identities: Vec<ProcessIdentity> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .zip(hosts)
                .map(|(g, h)| s.spawn(move || discover(g, h).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, id) in identities.iter().enumerate() {
            assert_eq!(id.rank, rank);
            assert_eq!(id.group_size, 4);
        }
        let node_a: Vec<_> = [0, 2]
            .iter()
            .map(|&r| identities[r].local_device_index)
            .collect();
        let node_b: Vec<_> = [1, 3]
            .iter()
            .map(|&r| identities[r].local_device_index)
            .collect();
        assert_eq!(node_a, vec![0, 1]);
        assert_eq!(node_b, vec![0, 1]);
    }
}
