//!
//! Vdev topology and redundant reads: the tree parsed out of the label
//! config, mirror member fallback and RAID-Z stripe reads
//!
use crate::nv::NvList;
use crate::raidz::{self, RaidzMap};
use crate::spa::{Dva, Label, DEVICE_DATA_OFFSET, SECTOR_SHIFT};
use crate::{RawDevice, ZfsError, ZfsErrorKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdevKind {
    Root,
    Mirror,
    RaidZ { nparity: usize },
    Disk,
    File,
}

/// One node of the vdev tree. Leaves carry a device binding, interior
/// nodes the redundancy layout.
#[derive(Debug, Clone)]
pub struct VdevNode {
    /// Position among the root's children; DVAs address top-level vdevs
    /// by this id.
    pub id: u64,
    pub guid: u64,
    pub kind: VdevKind,
    pub ashift: u32,
    pub path: Option<String>,
    pub children: Vec<usize>,
}

impl VdevNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, VdevKind::Disk | VdevKind::File)
    }
}

/// The pool topology as an arena of nodes, parsed from the `vdev_tree`
/// nvlist in a label config.
#[derive(Debug, Clone)]
pub struct VdevTree {
    pub nodes: Vec<VdevNode>,
    pub root: usize,
}

impl VdevTree {
    pub fn from_config(tree: &NvList) -> Result<Self, ZfsError> {
        let mut nodes = Vec::new();
        let root = Self::build(tree, &mut nodes)?;
        Ok(Self { nodes, root })
    }

    fn build(nv: &NvList, nodes: &mut Vec<VdevNode>) -> Result<usize, ZfsError> {
        let kind = match nv.get_str("type").ok_or(ZfsErrorKind::Invalid)? {
            "root" => VdevKind::Root,
            "mirror" => VdevKind::Mirror,
            "raidz" => VdevKind::RaidZ {
                nparity: nv.get_u64("nparity").unwrap_or(1) as usize,
            },
            "disk" => VdevKind::Disk,
            "file" => VdevKind::File,
            other => {
                log::warn!("unrecognized vdev type {:?}", other);
                return Err(ZfsErrorKind::Invalid.into());
            }
        };
        let idx = nodes.len();
        nodes.push(VdevNode {
            id: nv.get_u64("id").unwrap_or(0),
            guid: nv.get_u64("guid").unwrap_or(0),
            kind,
            ashift: nv.get_u64("ashift").unwrap_or(SECTOR_SHIFT as u64) as u32,
            path: nv.get_str("path").map(str::to_string),
            children: Vec::new(),
        });
        if let Some(children) = nv.get_list_array("children") {
            let mut built = Vec::with_capacity(children.len());
            for child in children {
                built.push(Self::build(child, nodes)?);
            }
            nodes[idx].children = built;
        }
        Ok(idx)
    }

    pub fn root(&self) -> &VdevNode {
        &self.nodes[self.root]
    }

    /// Look up a top-level vdev by the id DVAs carry.
    pub fn top_level(&self, vdev_id: u32) -> Result<usize, ZfsError> {
        self.nodes[self.root]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c].id == vdev_id as u64)
            .ok_or_else(|| ZfsErrorKind::NotFound.into())
    }

    /// Leaf node indices in tree order.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut out);
        out
    }

    fn collect_leaves(&self, idx: usize, out: &mut Vec<usize>) {
        let node = &self.nodes[idx];
        if node.is_leaf() {
            out.push(idx);
        }
        for &child in &node.children {
            self.collect_leaves(child, out);
        }
    }

    pub fn leaf_by_guid(&self, guid: u64) -> Option<usize> {
        self.leaves()
            .into_iter()
            .find(|&idx| self.nodes[idx].guid == guid)
    }
}

/// Read one of the four label copies off a device. Returns the label
/// together with its byte offset, which seeds uberblock verification.
pub fn read_label<D: RawDevice>(device: &D, copy: usize) -> Result<(Label, u64), ZfsError> {
    let size = device.capacity()?;
    if size < 4 * Label::SIZE {
        return Err(ZfsErrorKind::Invalid.into());
    }
    let offset = Label::offsets(size)[copy];
    let block = device.read_raw(offset, Label::SIZE)?;
    let (_, label) = Label::parse(block.as_ref())?;
    Ok((label, offset))
}

/// Redundancy-aware reads against an open device set. `binding` maps
/// tree node indices to entries in `devices`; only leaves are bound.
pub struct VdevReader<'a, D: RawDevice> {
    pub tree: &'a VdevTree,
    devices: &'a [D],
    binding: &'a [Option<usize>],
}

impl<'a, D: RawDevice> Clone for VdevReader<'a, D> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree,
            devices: self.devices,
            binding: self.binding,
        }
    }
}

impl<'a, D: RawDevice> VdevReader<'a, D> {
    pub fn new(tree: &'a VdevTree, devices: &'a [D], binding: &'a [Option<usize>]) -> Self {
        Self {
            tree,
            devices,
            binding,
        }
    }

    /// Raw read from the allocatable region of one leaf. `offset` is in
    /// bytes past the front labels and boot block.
    fn leaf_read(&self, node: usize, offset: u64, size: usize) -> Result<Vec<u8>, ZfsError> {
        let dev = self
            .binding
            .get(node)
            .and_then(|b| *b)
            .ok_or(ZfsErrorKind::NotFound)?;
        let block = self.devices[dev].read_raw(DEVICE_DATA_OFFSET + offset, size as u64)?;
        Ok(block.as_ref().to_vec())
    }

    /// Read and verify the physical bytes a DVA names. `verify` checks a
    /// candidate buffer; for RAID-Z it also drives combinatorial
    /// reconstruction when a column is silently corrupt.
    pub fn read_dva<F>(&self, dva: &Dva, psize: usize, verify: &F) -> Result<Vec<u8>, ZfsError>
    where
        F: Fn(&[u8]) -> Result<(), ZfsError>,
    {
        let top = self.tree.top_level(dva.vdev)?;
        match self.tree.nodes[top].kind {
            VdevKind::Disk | VdevKind::File => {
                let data = self.leaf_read(top, dva.offset << SECTOR_SHIFT, psize)?;
                verify(&data)?;
                Ok(data)
            }
            VdevKind::Mirror => self.read_mirror(top, dva, psize, verify),
            VdevKind::RaidZ { nparity } => self.read_raidz(top, nparity, dva, psize, verify),
            VdevKind::Root => Err(ZfsErrorKind::Invalid.into()),
        }
    }

    /// Try each mirror member in order; the first copy that verifies
    /// wins.
    fn read_mirror<F>(
        &self,
        top: usize,
        dva: &Dva,
        psize: usize,
        verify: &F,
    ) -> Result<Vec<u8>, ZfsError>
    where
        F: Fn(&[u8]) -> Result<(), ZfsError>,
    {
        let mut last: Option<ZfsError> = None;
        for &child in &self.tree.nodes[top].children {
            let attempt = self
                .leaf_read(child, dva.offset << SECTOR_SHIFT, psize)
                .and_then(|data| {
                    verify(&data)?;
                    Ok(data)
                });
            match attempt {
                Ok(data) => return Ok(data),
                Err(e) => {
                    log::warn!("mirror member {} failed: {}", child, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| ZfsErrorKind::NotFound.into()))
    }

    fn read_raidz<F>(
        &self,
        top: usize,
        nparity: usize,
        dva: &Dva,
        psize: usize,
        verify: &F,
    ) -> Result<Vec<u8>, ZfsError>
    where
        F: Fn(&[u8]) -> Result<(), ZfsError>,
    {
        let node = &self.tree.nodes[top];
        let width = node.children.len();
        if width == 0 || nparity >= width {
            return Err(ZfsErrorKind::Invalid.into());
        }
        let map = RaidzMap::allocate(dva.offset, psize, node.ashift, width, nparity);
        let reads: Vec<Option<Vec<u8>>> = map
            .cols
            .iter()
            .map(|c| self.leaf_read(node.children[c.devidx], c.offset, c.size).ok())
            .collect();

        // First attempt: repair outright read failures, then verify.
        let mut cols = reads.clone();
        let first = raidz::reconstruct(&map, &mut cols)
            .and_then(|_| map.assemble(&cols, psize))
            .and_then(|data| {
                verify(&data)?;
                Ok(data)
            });
        let first_err = match first {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };

        // A column read back without an I/O error but the block does not
        // verify, so one of the surviving columns is lying. Retry with
        // every subset of columns declared bad, smallest subsets first,
        // until one assembly verifies.
        let n = map.cols.len();
        for drop_count in 1..=nparity {
            for mask in 1u32..(1 << n) {
                if mask.count_ones() as usize != drop_count {
                    continue;
                }
                let mut cols = reads.clone();
                for (i, col) in cols.iter_mut().enumerate() {
                    if mask & (1 << i) != 0 {
                        *col = None;
                    }
                }
                if raidz::reconstruct(&map, &mut cols).is_err() {
                    continue;
                }
                if let Ok(data) = map.assemble(&cols, psize) {
                    if verify(&data).is_ok() {
                        log::debug!(
                            "raid-z combinatorial reconstruction succeeded, column mask {:#b}",
                            mask
                        );
                        return Ok(data);
                    }
                }
            }
        }
        Err(first_err)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checksum;
    use crate::nv::encode;
    use crate::raidz::generate_parity;
    use crate::spa::{Checksum, ChecksumType};
    use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};

    pub(crate) struct MemDisk(pub Vec<u8>);

    impl RawDevice for MemDisk {
        type Block = Vec<u8>;
        fn read_raw(&self, addr: u64, size: u64) -> IoResult<Self::Block> {
            let start = addr as usize;
            let end = start + size as usize;
            if end > self.0.len() {
                return Err(IoError::new(IoErrorKind::UnexpectedEof, "past device end"));
            }
            Ok(self.0[start..end].to_vec())
        }
        fn capacity(&self) -> IoResult<u64> {
            Ok(self.0.len() as u64)
        }
    }

    fn fletcher4_of(data: &[u8]) -> Checksum {
        checksum::checksum(&ChecksumType::Fletcher4, data).unwrap()
    }

    fn config_tree() -> VdevTree {
        let raidz = encode::list(&[
            encode::pair_str("type", "raidz"),
            encode::pair_u64("id", 0),
            encode::pair_u64("guid", 100),
            encode::pair_u64("nparity", 1),
            encode::pair_u64("ashift", 9),
            encode::pair_list_array(
                "children",
                &[
                    encode::list(&[
                        encode::pair_str("type", "disk"),
                        encode::pair_u64("guid", 101),
                        encode::pair_str("path", "/dev/va"),
                    ]),
                    encode::list(&[
                        encode::pair_str("type", "disk"),
                        encode::pair_u64("guid", 102),
                        encode::pair_str("path", "/dev/vb"),
                    ]),
                    encode::list(&[
                        encode::pair_str("type", "disk"),
                        encode::pair_u64("guid", 103),
                        encode::pair_str("path", "/dev/vc"),
                    ]),
                ],
            ),
        ]);
        let root = encode::list(&[
            encode::pair_str("type", "root"),
            encode::pair_list_array("children", &[raidz]),
        ]);
        let nv = NvList::unpack(&encode::packed(&root)).unwrap();
        VdevTree::from_config(&nv).unwrap()
    }

    #[test]
    fn tree_from_config() {
        let tree = config_tree();
        assert_eq!(tree.root().kind, VdevKind::Root);
        let top = tree.top_level(0).unwrap();
        assert_eq!(tree.nodes[top].kind, VdevKind::RaidZ { nparity: 1 });
        assert_eq!(tree.nodes[top].children.len(), 3);
        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 3);
        assert_eq!(tree.leaf_by_guid(102), Some(leaves[1]));
        assert_eq!(
            tree.nodes[tree.leaf_by_guid(101).unwrap()].path.as_deref(),
            Some("/dev/va")
        );
        assert!(tree.leaf_by_guid(999).is_none());
    }

    fn mirror_tree() -> VdevTree {
        VdevTree {
            nodes: vec![
                VdevNode {
                    id: 0,
                    guid: 1,
                    kind: VdevKind::Root,
                    ashift: 9,
                    path: None,
                    children: vec![1],
                },
                VdevNode {
                    id: 0,
                    guid: 2,
                    kind: VdevKind::Mirror,
                    ashift: 9,
                    path: None,
                    children: vec![2, 3],
                },
                VdevNode {
                    id: 0,
                    guid: 3,
                    kind: VdevKind::Disk,
                    ashift: 9,
                    path: None,
                    children: vec![],
                },
                VdevNode {
                    id: 0,
                    guid: 4,
                    kind: VdevKind::Disk,
                    ashift: 9,
                    path: None,
                    children: vec![],
                },
            ],
            root: 0,
        }
    }

    #[test]
    fn mirror_falls_back_to_good_member() {
        let tree = mirror_tree();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let expected = fletcher4_of(&data);
        let offset_sectors = 16u64;
        let byte_off = (DEVICE_DATA_OFFSET + (offset_sectors << SECTOR_SHIFT)) as usize;

        let mut good = vec![0u8; byte_off + 4096];
        good[byte_off..byte_off + data.len()].copy_from_slice(&data);
        let mut bad = good.clone();
        bad[byte_off + 5] ^= 0xff;

        let devices = vec![MemDisk(bad), MemDisk(good)];
        let binding = vec![None, None, Some(0), Some(1)];
        let reader = VdevReader::new(&tree, &devices, &binding);

        let dva = Dva {
            vdev: 0,
            grid: 0,
            asize: 2,
            offset: offset_sectors,
            gang: false,
        };
        let out = reader
            .read_dva(&dva, data.len(), &|d: &[u8]| {
                checksum::verify(&ChecksumType::Fletcher4, d, &expected)
            })
            .unwrap();
        assert_eq!(out, data);
    }

    fn raidz_tree(width: usize, nparity: usize) -> VdevTree {
        let mut nodes = vec![
            VdevNode {
                id: 0,
                guid: 1,
                kind: VdevKind::Root,
                ashift: 9,
                path: None,
                children: vec![1],
            },
            VdevNode {
                id: 0,
                guid: 2,
                kind: VdevKind::RaidZ { nparity },
                ashift: 9,
                path: None,
                children: (2..2 + width).collect(),
            },
        ];
        for i in 0..width {
            nodes.push(VdevNode {
                id: 0,
                guid: 10 + i as u64,
                kind: VdevKind::Disk,
                ashift: 9,
                path: None,
                children: vec![],
            });
        }
        VdevTree { nodes, root: 0 }
    }

    /// Build the member devices for one RAID-Z block: lay out the map,
    /// compute parity, scatter all columns into fresh images.
    fn raidz_devices(
        tree: &VdevTree,
        nparity: usize,
        offset_sectors: u64,
        data: &[u8],
    ) -> Vec<MemDisk> {
        let top = tree.top_level(0).unwrap();
        let width = tree.nodes[top].children.len();
        let map = RaidzMap::allocate(offset_sectors, data.len(), 9, width, nparity);

        let mut cols: Vec<Vec<u8>> = Vec::new();
        let mut taken = 0;
        for meta in map.data_cols() {
            let mut col = data[taken..(taken + meta.size).min(data.len())].to_vec();
            col.resize(meta.size, 0);
            taken += meta.size;
            cols.push(col);
        }
        let widest = map.cols[nparity].size;
        let data_refs: Vec<&[u8]> = cols.iter().map(|c| c.as_slice()).collect();
        let parity = generate_parity(&data_refs, nparity, widest);

        let mut devices: Vec<MemDisk> = (0..width)
            .map(|_| MemDisk(vec![0u8; (DEVICE_DATA_OFFSET as usize) + (1 << 20)]))
            .collect();
        for (i, meta) in map.cols.iter().enumerate() {
            let bytes = if i < nparity {
                &parity[i][..meta.size]
            } else {
                &cols[i - nparity][..]
            };
            let start = (DEVICE_DATA_OFFSET + meta.offset) as usize;
            devices[meta.devidx].0[start..start + bytes.len()].copy_from_slice(bytes);
        }
        devices
    }

    fn raidz_binding(tree: &VdevTree) -> Vec<Option<usize>> {
        let mut binding = vec![None; tree.nodes.len()];
        for (dev, leaf) in tree.leaves().into_iter().enumerate() {
            binding[leaf] = Some(dev);
        }
        binding
    }

    #[test]
    fn raidz_survives_lost_column() {
        let tree = raidz_tree(3, 1);
        let data: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 253) as u8).collect();
        let expected = fletcher4_of(&data);
        let offset_sectors = 24u64;
        let mut devices = raidz_devices(&tree, 1, offset_sectors, &data);

        // Wipe one member entirely.
        for b in devices[1].0.iter_mut() {
            *b = 0;
        }

        let binding = raidz_binding(&tree);
        let reader = VdevReader::new(&tree, &devices, &binding);
        let dva = Dva {
            vdev: 0,
            grid: 0,
            asize: 4,
            offset: offset_sectors,
            gang: false,
        };
        let out = reader
            .read_dva(&dva, data.len(), &|d: &[u8]| {
                checksum::verify(&ChecksumType::Fletcher4, d, &expected)
            })
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn raidz_finds_silently_corrupt_column() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tree = raidz_tree(4, 2);
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 13 % 241) as u8).collect();
        let expected = fletcher4_of(&data);
        let offset_sectors = 8u64;
        let mut devices = raidz_devices(&tree, 2, offset_sectors, &data);

        // Flip bytes in one data column without breaking the read path;
        // only the block checksum can catch this.
        let map = RaidzMap::allocate(offset_sectors, data.len(), 9, 4, 2);
        let victim = map.data_cols().last().unwrap().clone();
        let corrupt_at = (DEVICE_DATA_OFFSET + victim.offset) as usize;
        devices[victim.devidx].0[corrupt_at] ^= 0x55;
        devices[victim.devidx].0[corrupt_at + 17] ^= 0xaa;

        let binding = raidz_binding(&tree);
        let reader = VdevReader::new(&tree, &devices, &binding);
        let dva = Dva {
            vdev: 0,
            grid: 0,
            asize: 8,
            offset: offset_sectors,
            gang: false,
        };
        let out = reader
            .read_dva(&dva, data.len(), &|d: &[u8]| {
                checksum::verify(&ChecksumType::Fletcher4, d, &expected)
            })
            .unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn raidz_too_many_failures_is_fatal() {
        let tree = raidz_tree(3, 1);
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 199) as u8).collect();
        let expected = fletcher4_of(&data);
        let offset_sectors = 24u64;
        let mut devices = raidz_devices(&tree, 1, offset_sectors, &data);

        // Two lost members exceed single parity.
        devices[0].0.truncate(16);
        devices[1].0.truncate(16);

        let binding = raidz_binding(&tree);
        let reader = VdevReader::new(&tree, &devices, &binding);
        let dva = Dva {
            vdev: 0,
            grid: 0,
            asize: 4,
            offset: offset_sectors,
            gang: false,
        };
        assert!(reader
            .read_dva(&dva, data.len(), &|d: &[u8]| {
                checksum::verify(&ChecksumType::Fletcher4, d, &expected)
            })
            .is_err());
    }
}
