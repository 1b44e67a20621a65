//! Large-object tree: a height-balanced count index over byte
//! streams.
//!
//! Internal nodes carry `(count, child)` entries where `count` is the
//! byte span of the child subtree; height-0 children are data trains.
//! The root starts embedded in its owner's catalog slot and moves to
//! its own page (`separate_root_node`) once it outgrows the slot.

use log::debug;

use crate::{
    buffer::BufferClass,
    disk::{page_size, AllocScope, TRAIN_PAGES},
    error::{ErrorKind, StratumError},
    ids::PageId,
    io::{StratumReader, StratumWriter},
    page::{
        self, read_header, PAGE_HEADER_SIZE, PAGE_TYPE_LOT_DATA, PAGE_TYPE_LOT_NODE,
    },
    process::Thread,
    types::StratumResult,
};

/// Entries an embedded root may hold before its owner should call
/// `separate_root_node`.
pub const EMBEDDED_ROOT_MAX_ENTRIES: usize = 8;

const NODE_EXT_HEADER: usize = 4; // height u16, n_entries u16
const ENTRY_SIZE: usize = 8;

fn node_capacity() -> usize {
    (page_size() - PAGE_HEADER_SIZE - NODE_EXT_HEADER) / ENTRY_SIZE
}

fn data_train_capacity() -> usize {
    TRAIN_PAGES * page_size() - PAGE_HEADER_SIZE
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LotEntry {
    pub count: u32,
    pub child: u32,
}

/// One internal node. Height 1 nodes point at data trains.
#[derive(Debug, Clone, PartialEq)]
pub struct LotNode {
    pub height: u16,
    pub entries: Vec<LotEntry>,
}

impl LotNode {
    pub fn new() -> Self {
        Self {
            height: 1,
            entries: Vec::new(),
        }
    }

    pub fn span(&self) -> usize {
        self.entries.iter().map(|e| e.count as usize).sum()
    }
}

/// Where a LOT's root node lives.
#[derive(Debug, Clone)]
pub enum LotRoot {
    /// Inline in the owner's catalog slot.
    Embedded(LotNode),
    /// On its own LOT_NODE page.
    Page(PageId),
}

impl LotRoot {
    pub fn new() -> Self {
        LotRoot::Embedded(LotNode::new())
    }

    /// Whether the embedded node has outgrown its inline slot.
    pub fn needs_separation(&self) -> bool {
        match self {
            LotRoot::Embedded(node) => node.entries.len() > EMBEDDED_ROOT_MAX_ENTRIES,
            LotRoot::Page(_) => false,
        }
    }
}

// ---- node page codec ----

fn encode_node(data: &mut [u8], node: &LotNode) {
    let mut w = StratumWriter::new();
    w.write_u16(node.height);
    w.write_u16(node.entries.len() as u16);
    for e in &node.entries {
        w.write_u32(e.count);
        w.write_u32(e.child);
    }
    let bytes = w.to_bytes();
    data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(&bytes);
}

fn decode_node(data: &[u8]) -> LotNode {
    let mut r = StratumReader::new(&data[PAGE_HEADER_SIZE..]);
    let height = r.read_u16();
    let n = r.read_u16() as usize;
    let entries = (0..n)
        .map(|_| LotEntry {
            count: r.read_u32(),
            child: r.read_u32(),
        })
        .collect();
    LotNode { height, entries }
}

fn load_node(td: &Thread, pid: &PageId) -> Result<LotNode, StratumError> {
    let guard = td.buffer().get_train(pid, BufferClass::Page)?;
    let data = guard.read();
    let hdr = read_header(&data);
    if !hdr.is_type(PAGE_TYPE_LOT_NODE) {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(*pid),
            &format!("expected LOT node, header {}", page::dump_prefix(&data)),
        ));
    }
    Ok(decode_node(&data))
}

fn store_node(td: &Thread, pid: &PageId, node: &LotNode, fresh: bool) -> StratumResult {
    let guard = if fresh {
        td.buffer().get_new_train(pid, BufferClass::Page)?
    } else {
        td.buffer().get_train(pid, BufferClass::Page)?
    };
    {
        let mut data = guard.write();
        page::init_page(&mut data, PAGE_TYPE_LOT_NODE, *pid, PAGE_HEADER_SIZE);
        encode_node(&mut data, node);
    }
    guard.mark_dirty();
    Ok(())
}

// ---- data trains ----

fn alloc_data_train(td: &Thread, scope: &AllocScope, near: Option<PageId>) -> Result<PageId, StratumError> {
    let pids = td.disk().alloc_trains(
        scope.vol_no,
        scope.first_ext,
        near,
        scope.fill_factor,
        1,
        TRAIN_PAGES,
    )?;
    Ok(pids[0])
}

fn alloc_node_page(td: &Thread, scope: &AllocScope, near: Option<PageId>) -> Result<PageId, StratumError> {
    let pids = td.disk().alloc_trains(
        scope.vol_no,
        scope.first_ext,
        near,
        scope.fill_factor,
        1,
        1,
    )?;
    Ok(pids[0])
}

fn read_data(td: &Thread, pid: &PageId, off: usize, buf: &mut [u8]) -> StratumResult {
    let guard = td.buffer().get_train(pid, BufferClass::Train)?;
    let data = guard.read();
    let hdr = read_header(&data);
    if !hdr.is_type(PAGE_TYPE_LOT_DATA) {
        return Err(StratumError::new(
            ErrorKind::BadBtreePage(*pid),
            &format!("expected LOT data, header {}", page::dump_prefix(&data)),
        ));
    }
    let start = PAGE_HEADER_SIZE + off;
    buf.copy_from_slice(&data[start..start + buf.len()]);
    Ok(())
}

/// Read the whole used prefix of a data train.
fn read_data_all(td: &Thread, pid: &PageId, count: usize) -> Result<Vec<u8>, StratumError> {
    let mut buf = vec![0u8; count];
    read_data(td, pid, 0, &mut buf)?;
    Ok(buf)
}

fn write_data(td: &Thread, pid: &PageId, bytes: &[u8], fresh: bool) -> StratumResult {
    let guard = if fresh {
        td.buffer().get_new_train(pid, BufferClass::Train)?
    } else {
        td.buffer().get_train(pid, BufferClass::Train)?
    };
    {
        let mut data = guard.write();
        if fresh {
            page::init_page(&mut data, PAGE_TYPE_LOT_DATA, *pid, PAGE_HEADER_SIZE);
        }
        data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
    }
    guard.mark_dirty();
    Ok(())
}

fn free_data_train(td: &Thread, pid: &PageId) -> StratumResult {
    td.buffer().discard(pid, BufferClass::Train)?;
    td.disk().free_trains(pid.vol_no, &[*pid], TRAIN_PAGES)
}

fn free_node_page(td: &Thread, pid: &PageId) -> StratumResult {
    td.buffer().discard(pid, BufferClass::Page)?;
    td.disk().free_trains(pid.vol_no, &[*pid], 1)
}

// ---- root plumbing ----

fn load_root(td: &Thread, root: &LotRoot) -> Result<LotNode, StratumError> {
    match root {
        LotRoot::Embedded(node) => Ok(node.clone()),
        LotRoot::Page(pid) => load_node(td, pid),
    }
}

/// Store the root back, growing or collapsing page roots in place so
/// the root page id never changes.
fn store_root(
    td: &Thread,
    scope: &AllocScope,
    root: &mut LotRoot,
    mut node: LotNode,
) -> StratumResult {
    // a fully drained tree starts over flat
    if node.entries.is_empty() {
        node.height = 1;
    }
    match root {
        LotRoot::Embedded(slot) => {
            *slot = node;
            Ok(())
        }
        LotRoot::Page(pid) => {
            let pid = *pid;
            while node.entries.len() > node_capacity() {
                node = grow_level(td, scope, &pid, node)?;
            }
            while node.height > 1 && node.entries.len() == 1 {
                let child = PageId::new(pid.vol_no, node.entries[0].child);
                let inner = load_node(td, &child)?;
                free_node_page(td, &child)?;
                node = inner;
            }
            store_node(td, &pid, &node, false)
        }
    }
}

/// Move an overfull root's entries down into fresh children, raising
/// the root one level.
fn grow_level(
    td: &Thread,
    scope: &AllocScope,
    root_pid: &PageId,
    node: LotNode,
) -> Result<LotNode, StratumError> {
    let cap = node_capacity();
    let n_nodes = (node.entries.len() + cap - 1) / cap;
    let per_node = (node.entries.len() + n_nodes - 1) / n_nodes;

    let mut children = Vec::with_capacity(n_nodes);
    let mut near = *root_pid;
    for group in node.entries.chunks(per_node) {
        let part = LotNode {
            height: node.height,
            entries: group.to_vec(),
        };
        let pid = alloc_node_page(td, scope, Some(near))?;
        store_node(td, &pid, &part, true)?;
        children.push(LotEntry {
            count: part.span() as u32,
            child: pid.page_no,
        });
        near = pid;
    }

    debug!("lot root {} grew to height {}", root_pid, node.height + 1);
    Ok(LotNode {
        height: node.height + 1,
        entries: children,
    })
}

// ---- public operations ----

pub fn span(td: &Thread, root: &LotRoot) -> Result<usize, StratumError> {
    Ok(load_root(td, root)?.span())
}

/// Append `bytes` at the end of the stream.
pub fn append(td: &Thread, scope: &AllocScope, root: &mut LotRoot, bytes: &[u8]) -> StratumResult {
    let offset = span(td, root)?;
    insert(td, scope, root, offset, bytes)
}

/// Insert `bytes` at `offset`, shifting the tail right.
pub fn insert(
    td: &Thread,
    scope: &AllocScope,
    root: &mut LotRoot,
    offset: usize,
    bytes: &[u8],
) -> StratumResult {
    if bytes.is_empty() {
        return Ok(());
    }
    let mut node = load_root(td, root)?;
    if offset > node.span() {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            &format!("insert at {} beyond span {}", offset, node.span()),
        ));
    }
    insert_rec(td, scope, &mut node, offset, bytes)?;
    store_root(td, scope, root, node)
}

fn insert_rec(
    td: &Thread,
    scope: &AllocScope,
    node: &mut LotNode,
    offset: usize,
    bytes: &[u8],
) -> StratumResult {
    if node.height == 1 {
        return insert_into_data_level(td, scope, node, offset, bytes);
    }

    // pick the child owning `offset`; the stream-end boundary maps to
    // the last child so appends extend it
    let (idx, local) = child_for_offset(node, offset);
    let child_pid = PageId::new(scope.vol_no, node.entries[idx].child);
    let mut child = load_node(td, &child_pid)?;
    insert_rec(td, scope, &mut child, local, bytes)?;

    if child.entries.len() > node_capacity() {
        // carve the overfull child into evenly filled nodes; the
        // first keeps the child's page
        let cap = node_capacity();
        let n_nodes = (child.entries.len() + cap - 1) / cap;
        let per_node = (child.entries.len() + n_nodes - 1) / n_nodes;
        let height = child.height;
        let mut groups = child.entries.chunks(per_node);

        let first = LotNode {
            height,
            entries: groups.next().unwrap().to_vec(),
        };
        store_node(td, &child_pid, &first, false)?;
        node.entries[idx].count = first.span() as u32;

        let mut at = idx + 1;
        let mut near = child_pid;
        for group in groups {
            let part = LotNode {
                height,
                entries: group.to_vec(),
            };
            let pid = alloc_node_page(td, scope, Some(near))?;
            store_node(td, &pid, &part, true)?;
            node.entries.insert(
                at,
                LotEntry {
                    count: part.span() as u32,
                    child: pid.page_no,
                },
            );
            at += 1;
            near = pid;
        }
    } else {
        store_node(td, &child_pid, &child, false)?;
        node.entries[idx].count += bytes.len() as u32;
    }
    Ok(())
}

/// Offset to (entry index, offset inside that entry). `offset` equal
/// to the total span maps to the end of the last entry.
fn child_for_offset(node: &LotNode, offset: usize) -> (usize, usize) {
    let mut acc = 0usize;
    for (i, e) in node.entries.iter().enumerate() {
        let end = acc + e.count as usize;
        if offset <= end && (offset < end || i == node.entries.len() - 1) {
            return (i, offset - acc);
        }
        acc = end;
    }
    (node.entries.len().saturating_sub(1), offset.saturating_sub(acc))
}

fn insert_into_data_level(
    td: &Thread,
    scope: &AllocScope,
    node: &mut LotNode,
    offset: usize,
    bytes: &[u8],
) -> StratumResult {
    let cap = data_train_capacity();

    if node.entries.is_empty() {
        let mut rest = bytes;
        let mut near = None;
        while !rest.is_empty() {
            let take = rest.len().min(cap);
            let pid = alloc_data_train(td, scope, near)?;
            write_data(td, &pid, &rest[..take], true)?;
            node.entries.push(LotEntry {
                count: take as u32,
                child: pid.page_no,
            });
            near = Some(pid);
            rest = &rest[take..];
        }
        return Ok(());
    }

    let (idx, local) = child_for_offset(node, offset);
    let pid = PageId::new(scope.vol_no, node.entries[idx].child);
    let count = node.entries[idx].count as usize;

    if count + bytes.len() <= cap {
        // grows in place: shift the tail right
        let mut content = read_data_all(td, &pid, count)?;
        content.splice(local..local, bytes.iter().copied());
        write_data(td, &pid, &content, false)?;
        node.entries[idx].count = content.len() as u32;
        return Ok(());
    }

    // rebuild this page's stream and spread it over enough trains
    let mut content = read_data_all(td, &pid, count)?;
    content.splice(local..local, bytes.iter().copied());

    let mut new_entries = Vec::new();
    let n_pages = (content.len() + cap - 1) / cap;
    let per_page = (content.len() + n_pages - 1) / n_pages;
    let mut start = 0usize;
    let mut near = Some(pid);
    for i in 0..n_pages {
        let end = (start + per_page).min(content.len());
        let target = if i == 0 {
            pid
        } else {
            let p = alloc_data_train(td, scope, near)?;
            near = Some(p);
            p
        };
        write_data(td, &target, &content[start..end], i != 0)?;
        new_entries.push(LotEntry {
            count: (end - start) as u32,
            child: target.page_no,
        });
        start = end;
    }
    node.entries.splice(idx..idx + 1, new_entries);
    Ok(())
}

/// Delete `n` bytes starting at `offset`.
pub fn delete(
    td: &Thread,
    scope: &AllocScope,
    root: &mut LotRoot,
    offset: usize,
    n: usize,
) -> StratumResult {
    if n == 0 {
        return Ok(());
    }
    let mut node = load_root(td, root)?;
    if offset + n > node.span() {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            &format!("delete [{}, {}) beyond span {}", offset, offset + n, node.span()),
        ));
    }
    delete_rec(td, scope, &mut node, offset, n)?;
    store_root(td, scope, root, node)
}

fn delete_rec(
    td: &Thread,
    scope: &AllocScope,
    node: &mut LotNode,
    offset: usize,
    n: usize,
) -> StratumResult {
    let mut remaining = n;
    let mut acc = 0usize;
    let mut idx = 0usize;
    let mut dead: Vec<usize> = Vec::new();

    while idx < node.entries.len() && remaining > 0 {
        let count = node.entries[idx].count as usize;
        let start = acc;
        let end = acc + count;
        acc = end;

        if end <= offset {
            idx += 1;
            continue;
        }
        if start >= offset + n {
            break;
        }

        let local_start = offset.max(start) - start;
        let local_len = (offset + n).min(end) - (start + local_start);
        let child_no = node.entries[idx].child;

        if node.height == 1 {
            let pid = PageId::new(scope.vol_no, child_no);
            if local_len == count {
                free_data_train(td, &pid)?;
                dead.push(idx);
            } else {
                let mut content = read_data_all(td, &pid, count)?;
                content.drain(local_start..local_start + local_len);
                write_data(td, &pid, &content, false)?;
                node.entries[idx].count = content.len() as u32;
            }
        } else {
            let pid = PageId::new(scope.vol_no, child_no);
            let mut child = load_node(td, &pid)?;
            delete_rec(td, scope, &mut child, local_start, local_len)?;
            if child.entries.is_empty() {
                free_node_page(td, &pid)?;
                dead.push(idx);
            } else {
                store_node(td, &pid, &child, false)?;
                node.entries[idx].count -= local_len as u32;
            }
        }

        remaining -= local_len;
        idx += 1;
    }

    for i in dead.into_iter().rev() {
        node.entries.remove(i);
    }

    if node.height == 1 {
        merge_data_neighbors(td, scope, node)?;
    }
    Ok(())
}

/// Fold adjacent underfull data trains together so deletions do not
/// leave a trail of near-empty trains.
fn merge_data_neighbors(td: &Thread, scope: &AllocScope, node: &mut LotNode) -> StratumResult {
    let cap = data_train_capacity();
    let mut i = 0usize;
    while i + 1 < node.entries.len() {
        let a = node.entries[i];
        let b = node.entries[i + 1];
        if (a.count + b.count) as usize <= cap / 2 {
            let pid_a = PageId::new(scope.vol_no, a.child);
            let pid_b = PageId::new(scope.vol_no, b.child);
            let mut content = read_data_all(td, &pid_a, a.count as usize)?;
            content.extend(read_data_all(td, &pid_b, b.count as usize)?);
            write_data(td, &pid_a, &content, false)?;
            free_data_train(td, &pid_b)?;
            node.entries[i].count = content.len() as u32;
            node.entries.remove(i + 1);
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Read `buf.len()` bytes starting at `offset` into `buf`. The
/// scope names the owning file, and with it the volume the trains
/// live on.
pub fn read(
    td: &Thread,
    scope: &AllocScope,
    root: &LotRoot,
    offset: usize,
    buf: &mut [u8],
) -> StratumResult {
    let node = load_root(td, root)?;
    if offset + buf.len() > node.span() {
        return Err(StratumError::new(
            ErrorKind::BadParameter,
            &format!(
                "read [{}, {}) beyond span {}",
                offset,
                offset + buf.len(),
                node.span()
            ),
        ));
    }
    read_rec(td, scope.vol_no, &node, offset, buf)
}

fn read_rec(
    td: &Thread,
    vol_no: u16,
    node: &LotNode,
    offset: usize,
    buf: &mut [u8],
) -> StratumResult {
    let mut acc = 0usize;
    let mut filled = 0usize;

    for e in &node.entries {
        if filled == buf.len() {
            break;
        }
        let start = acc;
        let end = acc + e.count as usize;
        acc = end;

        let want_start = offset + filled;
        if end <= want_start {
            continue;
        }

        let local = want_start - start;
        let take = (end - want_start).min(buf.len() - filled);
        let pid = PageId::new(vol_no, e.child);

        if node.height == 1 {
            read_data(td, &pid, local, &mut buf[filled..filled + take])?;
        } else {
            let child = load_node(td, &pid)?;
            read_rec(td, vol_no, &child, local, &mut buf[filled..filled + take])?;
        }
        filled += take;
    }
    Ok(())
}

/// Move an embedded root into its own page near `near_pid`, allocated
/// from the owning file's extent. Returns the new root page.
pub fn separate_root_node(
    td: &Thread,
    scope: &AllocScope,
    near_pid: &PageId,
    root: &mut LotRoot,
) -> Result<PageId, StratumError> {
    let node = match root {
        LotRoot::Page(pid) => return Ok(*pid),
        LotRoot::Embedded(node) => node.clone(),
    };

    let new_root = alloc_node_page(td, scope, Some(*near_pid))?;
    store_node(td, &new_root, &node, true)?;
    *root = LotRoot::Page(new_root);
    debug!("lot root separated to {}", new_root);
    Ok(new_root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(counts: &[u32]) -> LotNode {
        LotNode {
            height: 1,
            entries: counts
                .iter()
                .enumerate()
                .map(|(i, &c)| LotEntry {
                    count: c,
                    child: i as u32,
                })
                .collect(),
        }
    }

    #[test]
    fn test_child_for_offset() {
        let n = node(&[10, 20, 30]);
        assert_eq!(child_for_offset(&n, 0), (0, 0));
        assert_eq!(child_for_offset(&n, 9), (0, 9));
        // a boundary belongs to the next child, except at stream end
        assert_eq!(child_for_offset(&n, 10), (1, 0));
        assert_eq!(child_for_offset(&n, 29), (1, 19));
        assert_eq!(child_for_offset(&n, 60), (2, 30));
    }

    #[test]
    fn test_node_codec_round_trip() {
        let n = LotNode {
            height: 3,
            entries: vec![
                LotEntry {
                    count: 4096,
                    child: 17,
                },
                LotEntry {
                    count: 12,
                    child: 99,
                },
            ],
        };
        let mut page = vec![0u8; 4096];
        encode_node(&mut page, &n);
        assert_eq!(decode_node(&page), n);
        assert_eq!(n.span(), 4108);
    }

    #[test]
    fn test_embedded_root_separation_threshold() {
        let mut root = LotRoot::new();
        assert!(!root.needs_separation());
        if let LotRoot::Embedded(n) = &mut root {
            n.entries = (0..EMBEDDED_ROOT_MAX_ENTRIES as u32 + 1)
                .map(|i| LotEntry { count: 1, child: i })
                .collect();
        }
        assert!(root.needs_separation());
    }
}
