//! DnsCache (§4.11): a trie over normalized lowercase request names; each
//! terminal node holds a (qtype, qclass)-keyed map of raw response byte
//! buffers and their absolute expiry. Grounded
//! on the donor's 27-way (`a-z`, `.`) trie, reimplemented per the spec's
//! arena-and-indices guidance: a `Vec<TrieNode>` arena with `Option<usize>`
//! child slots instead of pointers. The alphabet is widened to 38 symbols
//! (`a-z`, `0-9`, `-`, `.`) per the resolved Open Question — the donor's
//! 27-way alphabet silently dropped digits and hyphens, making most real
//! hostnames uncacheable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const ALPHABET_SIZE: usize = 38;

fn char_index(c: char) -> Option<usize> {
    match c {
        'a'..='z' => Some(c as usize - 'a' as usize),
        '0'..='9' => Some(26 + (c as usize - '0' as usize)),
        '-' => Some(36),
        '.' => Some(37),
        _ => None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One cached response, keyed within a node by (qtype, qclass) so that
/// an A and an AAAA query for the same name don't collide.
struct CacheEntry {
    expires_at: u64,
    response: Vec<u8>,
}

struct TrieNode {
    children: [Option<usize>; ALPHABET_SIZE],
    entries: HashMap<(u16, u16), CacheEntry>,
}

impl TrieNode {
    fn empty() -> Self {
        TrieNode {
            children: [None; ALPHABET_SIZE],
            entries: HashMap::new(),
        }
    }
}

/// Cache key: (lowercased qname, qtype, qclass). The trie is keyed on the
/// name alone (so its alphabet stays restricted to the name characters the
/// spec defines); qtype/qclass are folded into the leaf's entry map instead
/// of the walked key, so they never need their own alphabet symbols.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
}

impl CacheKey {
    pub fn from_query(name: &str, rtype: u16, rclass: u16) -> Self {
        Self {
            name: name.trim_end_matches('.').to_lowercase(),
            rtype,
            rclass,
        }
    }
}

/// Thread-safe DNS response cache: a 38-way trie with lazy TTL invalidation.
pub struct DnsCache {
    nodes: Mutex<Vec<TrieNode>>,
    max_nodes: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
    refused_count: AtomicU64,
}

impl DnsCache {
    pub fn new(max_size: usize) -> Self {
        DnsCache {
            nodes: Mutex::new(vec![TrieNode::empty()]),
            max_nodes: max_size.max(1),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
            refused_count: AtomicU64::new(0),
        }
    }

    /// Look up a cached response. Returns the response bytes if present and
    /// not logically expired; an expired entry is evicted from the node's
    /// entry map and counts as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let mut nodes = self.nodes.lock().unwrap();

        let mut cur = 0usize;
        for c in key.name.chars() {
            let idx = match char_index(c) {
                Some(i) => i,
                None => {
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            };
            match nodes[cur].children[idx] {
                Some(next) => cur = next,
                None => {
                    self.miss_count.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let entry_key = (key.rtype, key.rclass);
        let hit = match nodes[cur].entries.get(&entry_key) {
            Some(entry) if unix_now() < entry.expires_at => Some(entry.response.clone()),
            _ => None,
        };

        if hit.is_some() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            nodes[cur].entries.remove(&entry_key);
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Inserts a response with a TTL in seconds. A zero TTL is not cached.
    /// A name containing a character outside the 38-symbol alphabet aborts
    /// the insert with a warning; the cache intentionally refuses to key on
    /// such labels rather than silently truncating them.
    pub fn insert(&self, key: CacheKey, response_bytes: Vec<u8>, ttl_secs: u32) {
        if ttl_secs == 0 {
            return;
        }

        let mut nodes = self.nodes.lock().unwrap();

        if nodes.len() >= self.max_nodes {
            tracing::warn!(name = %key.name, "dns cache full, dropping insert");
            return;
        }

        let mut cur = 0usize;
        for c in key.name.chars() {
            let idx = match char_index(c) {
                Some(i) => i,
                None => {
                    tracing::warn!(name = %key.name, char = %c, "dns cache refuses non-alphabet character");
                    self.refused_count.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            cur = match nodes[cur].children[idx] {
                Some(next) => next,
                None => {
                    if nodes.len() >= self.max_nodes {
                        return;
                    }
                    nodes.push(TrieNode::empty());
                    let new_idx = nodes.len() - 1;
                    nodes[cur].children[idx] = Some(new_idx);
                    new_idx
                }
            };
        }

        nodes[cur].entries.insert(
            (key.rtype, key.rclass),
            CacheEntry {
                expires_at: unix_now() + ttl_secs as u64,
                response: response_bytes,
            },
        );
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    pub fn hit_count(&self) -> usize {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> usize {
        self.miss_count.load(Ordering::Relaxed)
    }

    pub fn refused_count(&self) -> u64 {
        self.refused_count.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.clear();
        nodes.push(TrieNode::empty());
        self.hit_count.store(0, Ordering::Relaxed);
        self.miss_count.store(0, Ordering::Relaxed);
    }
}

/// Extract the minimum TTL from a DNS response message's answer section.
pub fn min_ttl_from_response(msg: &hickory_proto::op::Message) -> u32 {
    msg.answers()
        .iter()
        .map(|r| r.ttl())
        .min()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trips() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("www.example.com", 1, 1);
        let data = vec![1, 2, 3, 4];

        cache.insert(key.clone(), data.clone(), 300);
        assert_eq!(cache.get(&key), Some(data));
        assert_eq!(cache.hit_count(), 1);
    }

    #[test]
    fn miss_on_unknown_name() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("example.com", 1, 1);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn zero_ttl_not_cached() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("example.com", 1, 1);
        cache.insert(key.clone(), vec![1, 2, 3], 0);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn widened_alphabet_accepts_digits_and_hyphens() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("host-01.corp-2.example.com", 1, 1);
        cache.insert(key.clone(), vec![9], 60);
        assert_eq!(cache.get(&key), Some(vec![9]));
        assert_eq!(cache.refused_count(), 0);
    }

    #[test]
    fn non_alphabet_character_is_refused() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("host_with_underscore.example.com", 1, 1);
        cache.insert(key.clone(), vec![1], 60);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.refused_count(), 1);
    }

    #[test]
    fn distinct_qtypes_do_not_collide() {
        let cache = DnsCache::new(1024);
        let a_key = CacheKey::from_query("example.com", 1, 1);
        let aaaa_key = CacheKey::from_query("example.com", 28, 1);
        cache.insert(a_key.clone(), vec![4], 60);
        cache.insert(aaaa_key.clone(), vec![16], 60);
        assert_eq!(cache.get(&a_key), Some(vec![4]));
        assert_eq!(cache.get(&aaaa_key), Some(vec![16]));
    }

    #[test]
    fn expired_leaf_counts_as_miss() {
        let cache = DnsCache::new(1024);
        let key = CacheKey::from_query("example.com", 1, 1);
        cache.insert(key.clone(), vec![1], 1);
        {
            let mut nodes = cache.nodes.lock().unwrap();
            let last = nodes.len() - 1;
            nodes[last].entries.get_mut(&(1, 1)).unwrap().expires_at = 0;
        }
        assert!(cache.get(&key).is_none());
    }
}
