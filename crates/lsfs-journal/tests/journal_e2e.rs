#![forbid(unsafe_code)]
//! End-to-end journal behavior on file-backed and in-memory flash.

use lsfs_journal::{FileFlash, FlashDevice, Journal, MemFlash, StateSwitch, scan};
use lsfs_node::{DentNode, Node, NodeGroupBuilder};
use lsfs_types::{FileType, HeadId, InodeNumber, align8};
use std::sync::Arc;

fn write_group(journal: &Journal, dents: &[DentNode], sync: bool) -> (u32, u32) {
    let total = dents.iter().map(|d| align8(d.encoded_len())).sum();
    let mut builder = NodeGroupBuilder::with_capacity(total).expect("alloc");
    for d in dents {
        builder.push_dent(d).expect("push");
    }
    let mut writer = journal.reserve_space(HeadId::BASE, total).expect("reserve");
    let group = builder.seal(|| journal.next_sqnum()).expect("seal");
    writer.write(group.bytes(), sync).expect("write")
}

fn dent(name: &str, target: u64) -> DentNode {
    DentNode {
        parent: InodeNumber::ROOT,
        name: name.as_bytes().to_vec(),
        target: InodeNumber(target),
        kind: FileType::RegularFile,
    }
}

#[test]
fn file_backed_log_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("log.img");
    {
        let flash: Arc<dyn FlashDevice> =
            Arc::new(FileFlash::create(&path, 1024, 4).expect("create"));
        let journal = Journal::new(flash, Arc::new(StateSwitch::new(false)), 1).expect("journal");
        write_group(&journal, &[dent("a", 2), dent("b", 3)], true);
        write_group(&journal, &[dent("c", 4)], true);
    }

    let flash: Arc<dyn FlashDevice> = Arc::new(FileFlash::open(&path, 1024).expect("open"));
    let report = scan(flash.as_ref()).expect("scan");
    let names: Vec<Vec<u8>> = report
        .nodes
        .iter()
        .map(|n| match &n.node {
            Node::Dent(d) => d.name.clone(),
            Node::Inode(_) => Vec::new(),
        })
        .collect();
    assert_eq!(names, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    let journal = Journal::open(flash, Arc::new(StateSwitch::new(false)), 1, &report)
        .expect("reopen");
    assert_eq!(journal.max_sqnum(), report.max_sqnum);
    let (lnum, offs) = write_group(&journal, &[dent("d", 5)], true);
    assert_eq!((lnum, offs), (1, 0), "reopened heads start on a fresh LEB");
    assert_eq!(journal.space_stats().free_lebs, 2);
}

#[test]
fn power_cut_keeps_only_synced_groups() {
    let flash = Arc::new(MemFlash::new(1024, 2).expect("flash"));
    let journal = Journal::new(flash.clone(), Arc::new(StateSwitch::new(false)), 1)
        .expect("journal");
    write_group(&journal, &[dent("kept", 2)], true);
    write_group(&journal, &[dent("lost", 3), dent("also-lost", 4)], false);

    let after = flash.power_cut();
    let report = scan(&after).expect("scan");
    assert_eq!(report.nodes.len(), 1);
    assert!(matches!(&report.nodes[0].node, Node::Dent(d) if d.name == b"kept"));
    assert_eq!(report.discarded, 0);
}
