//! Bitmap of fixed-size IPv4 blocks carved out of the cluster CIDR

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};

/// Largest number of blocks a set will track
const MAX_BLOCKS: u64 = 1 << 16;

#[derive(Clone, Debug)]
pub struct CidrSet {
    cluster: Ipv4Net,
    mask: u8,
    words: Vec<u64>,
    blocks: usize,
    allocated: usize,
}

impl CidrSet {
    pub fn new(cluster: Ipv4Net, mask: u8) -> Result<Self> {
        if mask < cluster.prefix_len() || mask > 32 {
            return Err(Error::ConfigError(format!(
                "node mask /{mask} does not fit cluster CIDR {cluster}"
            )));
        }
        let blocks = 1u64 << (mask - cluster.prefix_len());
        if blocks > MAX_BLOCKS {
            return Err(Error::ConfigError(format!(
                "cluster CIDR {cluster} at /{mask} yields {blocks} blocks, more than {MAX_BLOCKS}"
            )));
        }
        let blocks = blocks as usize;
        Ok(Self {
            cluster: cluster.trunc(),
            mask,
            words: vec![0; blocks.div_ceil(64)],
            blocks,
            allocated: 0,
        })
    }

    pub fn cluster(&self) -> Ipv4Net {
        self.cluster
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    fn is_set(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        if !self.is_set(index) {
            self.words[index / 64] |= 1 << (index % 64);
            self.allocated += 1;
        }
    }

    fn clear(&mut self, index: usize) {
        if self.is_set(index) {
            self.words[index / 64] &= !(1 << (index % 64));
            self.allocated -= 1;
        }
    }

    fn block(&self, index: usize) -> Ipv4Net {
        let step = 1u64 << (32 - self.mask as u32);
        let base = u64::from(u32::from(self.cluster.network()));
        let addr = Ipv4Addr::from((base + index as u64 * step) as u32);
        // mask is validated in `new`
        Ipv4Net::new(addr, self.mask).unwrap_or(self.cluster)
    }

    fn index_of(&self, addr: Ipv4Addr) -> usize {
        let offset = u64::from(u32::from(addr) - u32::from(self.cluster.network()));
        (offset >> (32 - self.mask as u32)) as usize
    }

    /// Indexes of the blocks overlapping `cidr`, empty when it is disjoint from the cluster
    fn overlapping(&self, cidr: &Ipv4Net) -> std::ops::Range<usize> {
        let cidr = cidr.trunc();
        if !(self.cluster.contains(&cidr) || cidr.contains(&self.cluster)) {
            return 0..0;
        }
        let first = cidr.network().max(self.cluster.network());
        let last = cidr.broadcast().min(self.cluster.broadcast());
        self.index_of(first)..self.index_of(last) + 1
    }

    /// Lowest free block
    pub fn allocate_next(&mut self) -> Result<Ipv4Net> {
        for (w, word) in self.words.iter().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let index = w * 64 + (!word).trailing_zeros() as usize;
            if index >= self.blocks {
                break;
            }
            self.set(index);
            return Ok(self.block(index));
        }
        Err(Error::CidrRangeExhausted)
    }

    /// Mark a node's block as used. It must lie inside the cluster CIDR.
    pub fn occupy(&mut self, cidr: &Ipv4Net) -> Result<()> {
        if !self.cluster.contains(cidr) {
            return Err(Error::CidrOutOfRange {
                cidr: cidr.to_string(),
                cluster: self.cluster.to_string(),
            });
        }
        for index in self.overlapping(cidr) {
            self.set(index);
        }
        Ok(())
    }

    /// Mark every block overlapping `cidr` as used; IPv6 and disjoint ranges are ignored
    pub fn reserve(&mut self, cidr: &IpNet) -> usize {
        let IpNet::V4(v4) = cidr else {
            return 0;
        };
        let range = self.overlapping(v4);
        let count = range.len();
        for index in range {
            self.set(index);
        }
        count
    }

    pub fn release(&mut self, cidr: &Ipv4Net) -> Result<()> {
        if !self.cluster.contains(cidr) {
            return Err(Error::CidrOutOfRange {
                cidr: cidr.to_string(),
                cluster: self.cluster.to_string(),
            });
        }
        for index in self.overlapping(cidr) {
            self.clear(index);
        }
        Ok(())
    }
}
