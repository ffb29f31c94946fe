//! Merkle roots and the partial Merkle trees carried by `merkleblock` messages.

use std::{fmt, io};

use crate::serialization::{sha256d, BitcoinDeserialize, BitcoinSerialize, SerializationError};
use crate::transaction;

/// The root of a block's transaction Merkle tree.
///
/// Note that because of a flaw in Bitcoin's design, the Merkle root does
/// not always precisely bind the contents of the block (CVE-2012-2459). It
/// is sometimes possible for an attacker to create multiple distinct sets of
/// transactions with the same Merkle root, although only one set will be
/// valid. Partial-tree reconstruction rejects the known duplication trick.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Root(pub [u8; 32]);

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut reversed_bytes = self.0;
        reversed_bytes.reverse();
        f.debug_tuple("merkle::Root")
            .field(&hex::encode(&reversed_bytes))
            .finish()
    }
}

impl BitcoinSerialize for Root {
    fn bitcoin_serialize<W: io::Write>(&self, mut writer: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(&mut writer)
    }
}

impl BitcoinDeserialize for Root {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Self, SerializationError> {
        Ok(Root(<[u8; 32]>::bitcoin_deserialize(&mut reader)?))
    }
}

fn hash_nodes(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut concat = [0u8; 64];
    concat[0..32].copy_from_slice(left);
    concat[32..64].copy_from_slice(right);
    sha256d::digest(&concat)
}

/// Compute the full Merkle root over a list of transaction ids, duplicating
/// the final hash of an odd-length level as Bitcoin does.
pub fn root_from_leaves(leaves: &[transaction::Hash]) -> Root {
    assert!(!leaves.is_empty(), "a block has at least one transaction");
    let mut level: Vec<[u8; 32]> = leaves.iter().map(|leaf| leaf.0).collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_nodes(&pair[0], pair.last().unwrap_or(&pair[0])))
            .collect();
    }
    Root(level[0])
}

/// The pruned Merkle tree a peer sends in place of a full block when a Bloom
/// filter is loaded: the total leaf count, the hashes of the pruned nodes and
/// matched leaves, and a bit vector describing a depth-first walk.
///
/// [BIP37](https://github.com/bitcoin/bips/blob/master/bip-0037.mediawiki)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialTree {
    transaction_count: u32,
    hashes: Vec<transaction::Hash>,
    flags: Vec<u8>,
}

impl PartialTree {
    pub fn new(transaction_count: u32, hashes: Vec<transaction::Hash>, flags: Vec<u8>) -> Self {
        PartialTree {
            transaction_count,
            hashes,
            flags,
        }
    }

    fn width_at(&self, height: u32) -> u32 {
        (self.transaction_count + (1 << height) - 1) >> height
    }

    /// Rebuild the tree from the depth-first walk, returning the implied root
    /// and the leaf transaction ids the peer flagged as matching our filter.
    ///
    /// The caller compares the returned root against the block header; this
    /// function only rejects trees that are structurally inconsistent.
    pub fn extract_matches(
        &self,
    ) -> Result<(Root, Vec<transaction::Hash>), SerializationError> {
        if self.transaction_count == 0 {
            return Err(SerializationError::Parse(
                "partial merkle tree with no transactions",
            ));
        }
        // An inclusion proof never carries more hashes than the block has
        // transactions.
        if self.hashes.len() as u64 > self.transaction_count as u64 {
            return Err(SerializationError::Parse(
                "partial merkle tree carries too many hashes",
            ));
        }

        let mut height = 0;
        while self.width_at(height) > 1 {
            height += 1;
        }

        let mut bits_used = 0usize;
        let mut hashes_used = 0usize;
        let mut matches = Vec::new();
        let root = self.traverse(height, 0, &mut bits_used, &mut hashes_used, &mut matches)?;

        if hashes_used != self.hashes.len() {
            return Err(SerializationError::Parse(
                "partial merkle tree did not consume all hashes",
            ));
        }
        // The bit vector is padded to a full byte; the padding must be zero.
        if (bits_used + 7) / 8 != self.flags.len() {
            return Err(SerializationError::Parse(
                "partial merkle tree did not consume all flag bytes",
            ));
        }
        for bit in bits_used..self.flags.len() * 8 {
            if (self.flags[bit >> 3] >> (bit & 7)) & 1 == 1 {
                return Err(SerializationError::Parse(
                    "partial merkle tree has nonzero padding bits",
                ));
            }
        }

        Ok((Root(root), matches))
    }

    fn traverse(
        &self,
        height: u32,
        position: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matches: &mut Vec<transaction::Hash>,
    ) -> Result<[u8; 32], SerializationError> {
        if *bits_used >= self.flags.len() * 8 {
            return Err(SerializationError::Parse(
                "partial merkle tree ran out of flag bits",
            ));
        }
        let descend = (self.flags[*bits_used >> 3] >> (*bits_used & 7)) & 1 == 1;
        *bits_used += 1;

        if height == 0 || !descend {
            // A pruned subtree, or a leaf: the next hash is used as-is.
            if *hashes_used >= self.hashes.len() {
                return Err(SerializationError::Parse(
                    "partial merkle tree ran out of hashes",
                ));
            }
            let hash = self.hashes[*hashes_used];
            *hashes_used += 1;
            if height == 0 && descend {
                matches.push(hash);
            }
            Ok(hash.0)
        } else {
            let left = self.traverse(height - 1, position * 2, bits_used, hashes_used, matches)?;
            let right = if position * 2 + 1 < self.width_at(height - 1) {
                let right =
                    self.traverse(height - 1, position * 2 + 1, bits_used, hashes_used, matches)?;
                // Identical children are the CVE-2012-2459 duplication trick.
                if right == left {
                    return Err(SerializationError::Parse(
                        "partial merkle tree has duplicate child hashes",
                    ));
                }
                right
            } else {
                left
            };
            Ok(hash_nodes(&left, &right))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(n: u8) -> transaction::Hash {
        transaction::Hash([n; 32])
    }

    /// Build the peer's side of a partial tree: a depth-first walk emitting a
    /// flag bit per visited node and a hash for each pruned subtree or leaf.
    fn build_partial(
        leaves: &[transaction::Hash],
        matched: &[bool],
        height: u32,
        position: u32,
        bits: &mut Vec<bool>,
        hashes: &mut Vec<transaction::Hash>,
    ) -> [u8; 32] {
        let width = |h: u32| (leaves.len() as u32 + (1 << h) - 1) >> h;
        let any_match = {
            let start = (position << height) as usize;
            let end = std::cmp::min(((position + 1) << height) as usize, leaves.len());
            matched[start..end].iter().any(|m| *m)
        };
        bits.push(any_match);
        if height == 0 || !any_match {
            let own = subtree_hash(leaves, height, position);
            hashes.push(transaction::Hash(own));
            own
        } else {
            let left = build_partial(leaves, matched, height - 1, position * 2, bits, hashes);
            let right = if position * 2 + 1 < width(height - 1) {
                build_partial(leaves, matched, height - 1, position * 2 + 1, bits, hashes)
            } else {
                left
            };
            hash_nodes(&left, &right)
        }
    }

    fn subtree_hash(leaves: &[transaction::Hash], height: u32, position: u32) -> [u8; 32] {
        if height == 0 {
            return leaves[position as usize].0;
        }
        let width = |h: u32| (leaves.len() as u32 + (1 << h) - 1) >> h;
        let left = subtree_hash(leaves, height - 1, position * 2);
        let right = if position * 2 + 1 < width(height - 1) {
            subtree_hash(leaves, height - 1, position * 2 + 1)
        } else {
            left
        };
        hash_nodes(&left, &right)
    }

    fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                bytes[i >> 3] |= 1 << (i & 7);
            }
        }
        bytes
    }

    #[test]
    fn eleven_leaf_reconstruction_matches_full_root() {
        let leaves: Vec<_> = (0u8..11).map(leaf).collect();
        // An arbitrary mask of matched leaves.
        let matched = [
            false, true, false, false, true, true, false, false, false, false, true,
        ];

        let mut height = 0;
        while (leaves.len() as u32 + (1 << height) - 1) >> height > 1 {
            height += 1;
        }
        let mut bits = Vec::new();
        let mut hashes = Vec::new();
        build_partial(&leaves, &matched, height, 0, &mut bits, &mut hashes);

        let tree = PartialTree::new(leaves.len() as u32, hashes, pack_bits(&bits));
        let (root, found) = tree.extract_matches().expect("tree is well formed");

        assert_eq!(root, root_from_leaves(&leaves));
        let expected: Vec<_> = leaves
            .iter()
            .zip(matched.iter())
            .filter(|(_, m)| **m)
            .map(|(leaf, _)| *leaf)
            .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn no_matches_yields_single_hash() {
        let leaves: Vec<_> = (0u8..7).map(leaf).collect();
        let matched = [false; 7];

        let mut bits = Vec::new();
        let mut hashes = Vec::new();
        build_partial(&leaves, &matched, 3, 0, &mut bits, &mut hashes);

        let tree = PartialTree::new(7, hashes.clone(), pack_bits(&bits));
        assert_eq!(hashes.len(), 1);
        let (root, found) = tree.extract_matches().expect("tree is well formed");
        assert_eq!(root, root_from_leaves(&leaves));
        assert!(found.is_empty());
    }

    #[test]
    fn truncated_flag_bits_are_rejected() {
        let leaves: Vec<_> = (0u8..4).map(leaf).collect();
        let matched = [true, false, false, false];

        let mut bits = Vec::new();
        let mut hashes = Vec::new();
        build_partial(&leaves, &matched, 2, 0, &mut bits, &mut hashes);

        // Drop the final flag byte.
        let mut flags = pack_bits(&bits);
        flags.pop();
        let tree = PartialTree::new(4, hashes, flags);
        assert!(tree.extract_matches().is_err());
    }

    #[test]
    fn single_transaction_block() {
        let only = leaf(42);
        let tree = PartialTree::new(1, vec![only], vec![0x01]);
        let (root, found) = tree.extract_matches().expect("tree is well formed");
        assert_eq!(root.0, only.0);
        assert_eq!(found, vec![only]);
    }
}
