//! Log scanning for recovery.
//!
//! Every LEB is walked from offset 0. Nodes follow each other at 8-byte
//! aligned offsets; the walk of a LEB stops at the first all-erased tail or
//! at the first node that fails verification. Group members are held back
//! until their `LAST_OF_GROUP` node is seen, so a group torn by a power cut
//! contributes nothing.

use crate::device::{ERASED, FlashDevice};
use lsfs_error::{LsfsError, Result};
use lsfs_node::{GroupType, Node, decode_node};
use lsfs_types::{NodeLocation, ParseError, SeqNum, align8};

/// Convert a parse failure at `(lnum, offs)` into a runtime error.
#[must_use]
pub fn corruption(lnum: u32, offs: u32, err: &ParseError) -> LsfsError {
    LsfsError::Corruption {
        lnum,
        offs,
        detail: err.to_string(),
    }
}

/// A committed node found on flash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedNode {
    pub location: NodeLocation,
    pub sqnum: SeqNum,
    pub node: Node,
}

/// How much of a LEB the scan found programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LebUsage {
    pub lnum: u32,
    /// Offset of the first erased byte, or the LEB size when the LEB ends in
    /// a corrupt node.
    pub used: u32,
}

/// Where a LEB's valid data ended in garbage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptTail {
    pub lnum: u32,
    pub offs: u32,
    pub detail: String,
}

/// Outcome of [`scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Committed nodes in ascending sequence-number order.
    pub nodes: Vec<ScannedNode>,
    pub lebs: Vec<LebUsage>,
    /// Nodes dropped because their group never completed.
    pub discarded: usize,
    pub corrupt: Vec<CorruptTail>,
    /// Highest sequence number seen, discarded nodes included.
    pub max_sqnum: SeqNum,
}

/// Read the whole device and collect every committed node.
pub fn scan(device: &dyn FlashDevice) -> Result<ScanReport> {
    let leb_size = device.leb_size();
    let mut report = ScanReport::default();
    let mut buf = vec![0_u8; leb_size as usize];

    for lnum in 0..device.leb_count() {
        device.read(lnum, 0, &mut buf)?;
        let used = scan_leb(lnum, &buf, &mut report);
        report.lebs.push(LebUsage { lnum, used });
    }
    report.nodes.sort_by_key(|node| node.sqnum);

    tracing::debug!(
        target: "lsfs::scan",
        nodes = report.nodes.len(),
        discarded = report.discarded,
        corrupt = report.corrupt.len(),
        max_sqnum = report.max_sqnum.0,
        "scan_complete"
    );
    Ok(report)
}

fn scan_leb(lnum: u32, leb: &[u8], report: &mut ScanReport) -> u32 {
    let leb_size = u32::try_from(leb.len()).unwrap_or(u32::MAX);
    let mut pending: Vec<ScannedNode> = Vec::new();
    let mut offs: usize = 0;
    let mut used = leb_size;

    while offs < leb.len() {
        let rest = &leb[offs..];
        let offs32 = u32::try_from(offs).unwrap_or(u32::MAX);
        if rest.iter().all(|b| *b == ERASED) {
            used = offs32;
            break;
        }
        let decoded = match decode_node(rest) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(
                    target: "lsfs::scan",
                    lnum,
                    offs = offs32,
                    error = %err,
                    "corrupt_node"
                );
                report.corrupt.push(CorruptTail {
                    lnum,
                    offs: offs32,
                    detail: err.to_string(),
                });
                break;
            }
        };

        let header = decoded.header;
        report.max_sqnum = report.max_sqnum.max(header.sqnum);
        let node = ScannedNode {
            location: NodeLocation {
                lnum,
                offs: offs32,
                len: header.len,
            },
            sqnum: header.sqnum,
            node: decoded.node,
        };
        match header.group_type {
            GroupType::NoGroup => {
                discard(lnum, &mut pending, report);
                report.nodes.push(node);
            }
            GroupType::InGroup => pending.push(node),
            GroupType::LastOfGroup => {
                pending.push(node);
                report.nodes.append(&mut pending);
            }
        }
        offs = align8(offs + header.len as usize);
    }

    discard(lnum, &mut pending, report);
    used
}

fn discard(lnum: u32, pending: &mut Vec<ScannedNode>, report: &mut ScanReport) {
    if pending.is_empty() {
        return;
    }
    tracing::warn!(
        target: "lsfs::scan",
        lnum,
        nodes = pending.len(),
        first_sqnum = pending[0].sqnum.0,
        "incomplete_group_discarded"
    );
    report.discarded += pending.len();
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemFlash;
    use lsfs_node::{DentNode, NodeGroupBuilder};
    use lsfs_types::{FileType, InodeNumber};

    fn dent(name: &str, target: u64) -> DentNode {
        DentNode {
            parent: InodeNumber(1),
            name: name.as_bytes().to_vec(),
            target: InodeNumber(target),
            kind: FileType::RegularFile,
        }
    }

    fn group(dents: &[DentNode], first_sqnum: u64) -> Vec<u8> {
        let total = dents.iter().map(|d| align8(d.encoded_len())).sum();
        let mut builder = NodeGroupBuilder::with_capacity(total).expect("alloc");
        for d in dents {
            builder.push_dent(d).expect("push");
        }
        let mut next = first_sqnum;
        builder
            .seal(|| {
                let sqnum = SeqNum(next);
                next += 1;
                sqnum
            })
            .expect("seal")
            .bytes()
            .to_vec()
    }

    #[test]
    fn empty_device_yields_nothing() {
        let flash = MemFlash::new(256, 3).expect("flash");
        let report = scan(&flash).expect("scan");
        assert!(report.nodes.is_empty());
        assert_eq!(report.lebs.len(), 3);
        assert!(report.lebs.iter().all(|usage| usage.used == 0));
        assert_eq!(report.max_sqnum, SeqNum(0));
    }

    #[test]
    fn complete_groups_are_kept_in_sqnum_order() {
        let flash = MemFlash::new(512, 2).expect("flash");
        let late = group(&[dent("c", 12)], 9);
        let early = group(&[dent("a", 10), dent("b", 11)], 3);
        flash.write(1, 0, &late).expect("write");
        flash.write(0, 0, &early).expect("write");

        let report = scan(&flash).expect("scan");
        let sqnums: Vec<u64> = report.nodes.iter().map(|n| n.sqnum.0).collect();
        assert_eq!(sqnums, vec![3, 4, 9]);
        assert_eq!(report.nodes[1].location.offs, 64);
        assert_eq!(report.lebs[0].used as usize, early.len());
        assert_eq!(report.max_sqnum, SeqNum(9));
    }

    #[test]
    fn group_without_last_node_is_discarded() {
        let flash = MemFlash::new(512, 1).expect("flash");
        let bytes = group(&[dent("a", 10), dent("b", 11)], 1);
        // Only the first member reached flash.
        flash.write(0, 0, &bytes[..64]).expect("write");

        let report = scan(&flash).expect("scan");
        assert!(report.nodes.is_empty());
        assert_eq!(report.discarded, 1);
        assert_eq!(report.max_sqnum, SeqNum(1));
    }

    #[test]
    fn torn_last_node_discards_group_and_reports_corruption() {
        let flash = MemFlash::new(512, 1).expect("flash");
        let bytes = group(&[dent("a", 10), dent("b", 11)], 1);
        flash.write(0, 0, &bytes[..100]).expect("write");

        let report = scan(&flash).expect("scan");
        assert!(report.nodes.is_empty());
        assert_eq!(report.discarded, 1);
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.corrupt[0].offs, 64);
        assert_eq!(report.lebs[0].used, 512);
    }

    #[test]
    fn corruption_error_carries_position() {
        let err = corruption(
            4,
            128,
            &ParseError::ChecksumMismatch {
                stored: 1,
                computed: 2,
            },
        );
        assert!(matches!(err, LsfsError::Corruption { lnum: 4, offs: 128, .. }));
    }
}
