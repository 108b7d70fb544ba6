//!
//! Pool orchestration: device assembly, uberblock election, the meta
//! object set, and dataset traversal down to file bytes
//!
use std::cell::RefCell;
use std::collections::BTreeMap;

use nom::number::complete as number;

use crate::dmu::{DNodePhys, Object, ObjsetPhys};
use crate::dsl::{DatasetPhys, DirPhys};
use crate::history::{HistoryIter, HistoryRecord};
use crate::nv::NvList;
use crate::spa::{select_uberblock, BlockPtr, Label, Uberblock, BLOCK_PTR_SIZE};
use crate::vdev::{self, VdevReader, VdevTree};
use crate::zap::{
    zap_hash, zap_hash_idx, zap_leaf_hash_numentries, ZapBlock, ZapLeaf, ZapValue,
};
use crate::zpl::{DirEntry, SaAttrPhys, MASTER_NODE_ROOT};
use crate::{RawDevice, ReadContext, ReadProps, ZfsError, ZfsErrorKind};

/// Object number of the MOS object directory.
pub const MOS_OBJECT_DIRECTORY: u64 = 1;
/// Object number of a filesystem's master node.
pub const MASTER_NODE_OBJECT: u64 = 1;

/// An imported read-only pool: the device set, its topology, and the
/// elected uberblock with the meta object set it roots.
pub struct Pool<D: RawDevice> {
    devices: Vec<D>,
    tree: VdevTree,
    binding: Vec<Option<usize>>,
    name: String,
    guid: u64,
    uberblock: Uberblock,
    mos_phys: ObjsetPhys,
}

impl<D: RawDevice> Pool<D> {
    /// Assemble a pool from its member devices: read every label copy,
    /// take the first config that unpacks, bind devices to leaves by
    /// guid, elect the uberblock and load the meta object set.
    pub fn open(devices: Vec<D>) -> Result<Self, ZfsError> {
        let mut config: Option<NvList> = None;
        let mut candidates = Vec::new();
        let mut device_guids = Vec::with_capacity(devices.len());
        for (dev_idx, device) in devices.iter().enumerate() {
            let mut device_guid = None;
            for copy in 0..Label::COUNT {
                let (label, offset) = match vdev::read_label(device, copy) {
                    Ok(l) => l,
                    Err(e) => {
                        log::warn!("device {} label {} unreadable: {}", dev_idx, copy, e);
                        continue;
                    }
                };
                let nv = match NvList::unpack(&label.nv_config) {
                    Ok(nv) => nv,
                    Err(e) => {
                        log::warn!("device {} label {} config corrupt: {}", dev_idx, copy, e);
                        continue;
                    }
                };
                candidates.extend(label.uberblocks(Self::ring_ashift(&nv), offset));
                if device_guid.is_none() {
                    device_guid = nv.get_u64("guid");
                }
                if config.is_none() {
                    config = Some(nv);
                }
            }
            device_guids.push(device_guid);
        }
        let config = config.ok_or(ZfsErrorKind::Invalid)?;
        let name = config.get_str("name").unwrap_or("").to_string();
        let guid = config.get_u64("pool_guid").unwrap_or(0);
        let tree =
            VdevTree::from_config(config.get_list("vdev_tree").ok_or(ZfsErrorKind::Invalid)?)?;

        // Prefer guid matches; unmatched devices fall back to tree
        // order so half-labeled test images still assemble.
        let leaves = tree.leaves();
        let mut binding = vec![None; tree.nodes.len()];
        for (dev_idx, device_guid) in device_guids.iter().enumerate() {
            let leaf = device_guid
                .and_then(|g| tree.leaf_by_guid(g))
                .or_else(|| leaves.get(dev_idx).copied());
            if let Some(leaf) = leaf {
                binding[leaf] = Some(dev_idx);
            }
        }

        let uberblock = select_uberblock(candidates).ok_or(ZfsErrorKind::Invalid)?;
        log::info!(
            "pool {:?}: elected uberblock txg {} version {}",
            name,
            uberblock.txg,
            uberblock.version
        );

        let mos_phys = {
            let reader = VdevReader::new(&tree, &devices, &binding);
            let ctx = ReadContext::new(reader);
            let root = ctx.resolve(&uberblock.rootbp, &ReadProps::default())?;
            ObjsetPhys::parse(&root)?.1
        };

        Ok(Self {
            devices,
            tree,
            binding,
            name,
            guid,
            uberblock,
            mos_phys,
        })
    }

    /// Uberblock ring slots are sized by the largest ashift in the
    /// label's vdev subtree, with a 1K floor.
    fn ring_ashift(config: &NvList) -> u32 {
        let tree = match config.get_list("vdev_tree") {
            Some(t) => t,
            None => return 9,
        };
        tree.get_u64("ashift")
            .or_else(|| {
                tree.get_list_array("children")?
                    .iter()
                    .filter_map(|c| c.get_u64("ashift"))
                    .max()
            })
            .unwrap_or(9) as u32
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn uberblock(&self) -> &Uberblock {
        &self.uberblock
    }

    pub fn vdev_tree(&self) -> &VdevTree {
        &self.tree
    }

    pub fn read_context(&self) -> ReadContext<'_, D> {
        ReadContext::new(VdevReader::new(&self.tree, &self.devices, &self.binding))
    }

    /// The meta object set, which holds the DSL and pool-wide objects.
    pub fn mos(&self) -> ObjectSet<'_, D> {
        ObjectSet {
            ctx: self.read_context(),
            phys: self.mos_phys.clone(),
        }
    }

    /// Look up a name in the MOS object directory.
    pub fn object_directory_lookup(&self, name: &str) -> Result<Option<u64>, ZfsError> {
        let mos = self.mos();
        let dir = mos.dnode(MOS_OBJECT_DIRECTORY)?;
        Ok(mos.zap_lookup(&dir, name.as_bytes())?.and_then(|v| v.as_u64()))
    }

    /// The dataset at the root of the DSL hierarchy.
    pub fn root_dataset(&self) -> Result<Dataset<'_, D>, ZfsError> {
        let dir_obj = self
            .object_directory_lookup("root_dataset")?
            .ok_or(ZfsErrorKind::NotFound)?;
        self.dataset_from_dir_obj(self.name.clone(), dir_obj)
    }

    /// Walk a slash-separated dataset path. The leading pool name is
    /// accepted and skipped. A missing component is not an error.
    pub fn dataset_for(&self, path: &str) -> Result<Option<Dataset<'_, D>>, ZfsError> {
        let mut dataset = self.root_dataset()?;
        let mut parts = path.split('/').filter(|p| !p.is_empty()).peekable();
        if parts.peek() == Some(&self.name.as_str()) {
            parts.next();
        }
        for part in parts {
            dataset = match dataset.child(part)? {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(dataset))
    }

    fn dataset_from_dir_obj(&self, name: String, dir_obj: u64) -> Result<Dataset<'_, D>, ZfsError> {
        let mos = self.mos();
        let dir = match mos.object(dir_obj)? {
            Object::DslDir(d) => *d,
            _ => return Err(ZfsErrorKind::Invalid.into()),
        };
        let dataset = match mos.object(dir.head_dataset_obj)? {
            Object::Dataset(d) => *d,
            _ => return Err(ZfsErrorKind::Invalid.into()),
        };
        Ok(Dataset {
            pool: self,
            name,
            dir,
            dataset,
            children: RefCell::new(None),
        })
    }

    /// Decode the pool history log up to its end-of-file cursor. Each
    /// record decodes independently; corrupt ones come back as errors
    /// in place.
    pub fn history(&self) -> Result<Vec<Result<HistoryRecord, ZfsError>>, ZfsError> {
        let obj = self
            .object_directory_lookup("history")?
            .ok_or(ZfsErrorKind::NotFound)?;
        let mos = self.mos();
        let (dnode, phys) = match mos.object(obj)? {
            Object::History(dnode, phys) => (dnode, phys),
            _ => return Err(ZfsErrorKind::Invalid.into()),
        };
        let data = mos.read(&dnode)?;
        let live = phys.live_records(&data);
        Ok(HistoryIter::new(&live).collect())
    }
}

/// One object set plus the read context to dereference it.
pub struct ObjectSet<'a, D: RawDevice> {
    pub ctx: ReadContext<'a, D>,
    pub phys: ObjsetPhys,
}

impl<'a, D: RawDevice> ObjectSet<'a, D> {
    pub fn dnode(&self, id: u64) -> Result<DNodePhys, ZfsError> {
        self.ctx.read_dnode(&self.phys.metadnode, id)
    }

    /// Fetch and classify an object by number.
    pub fn object(&self, id: u64) -> Result<Object, ZfsError> {
        Object::from_dnode(self.dnode(id)?)
    }

    /// The whole object as one logical byte stream.
    pub fn read(&self, dnode: &DNodePhys) -> Result<Vec<u8>, ZfsError> {
        self.ctx.read_object(dnode)
    }

    /// Point lookup in a ZAP object of either form.
    pub fn zap_lookup(&self, zap_dnode: &DNodePhys, key: &[u8]) -> Result<Option<ZapValue>, ZfsError> {
        let block = self.ctx.read_block(zap_dnode, 0)?;
        let block_size = zap_dnode.header.datablkszsec as usize * 512;
        let leaf_block_shift = zap_leaf_hash_numentries(block_size).trailing_zeros();
        let (_, header) = ZapBlock::parse(&block, block_size)?;
        match header {
            ZapBlock::Micro(micro) => Ok(micro.lookup(key).map(|v| ZapValue::U64(vec![v]))),
            ZapBlock::FatHeader(header) => {
                let hash = zap_hash(header.salt, key);
                let idx = zap_hash_idx(hash, header.ptrtbl.shift as u8);
                let mut leaf_block_num = if header.ptrtbl.blk == 0 {
                    // embedded pointer table
                    *header
                        .leafs
                        .get(idx as usize)
                        .ok_or(ZfsErrorKind::Invalid)?
                } else {
                    let block_idx = idx / (block_size as u64 / 8);
                    let slot = idx as usize % (block_size / 8);
                    if block_idx >= header.ptrtbl.numblks {
                        return Err(ZfsErrorKind::Invalid.into());
                    }
                    let tbl = self.ctx.read_block(zap_dnode, header.ptrtbl.blk + block_idx)?;
                    number::le_u64(&tbl[slot * 8..])?.1
                };
                if leaf_block_num == 0 {
                    return Ok(None);
                }
                // walk the chained leaf blocks
                loop {
                    let block = self.ctx.read_block(zap_dnode, leaf_block_num)?;
                    let (_, leaf) = ZapLeaf::parse(&block, block_size)?;
                    if let Some(value) = leaf.lookup(key, hash, leaf_block_shift) {
                        return Ok(Some(value));
                    }
                    if leaf.hdr.next == 0 {
                        return Ok(None);
                    }
                    leaf_block_num = leaf.hdr.next;
                }
            }
            ZapBlock::FatLeaf(_) => Err(ZfsErrorKind::Invalid.into()),
        }
    }

    /// Every entry of a ZAP object.
    pub fn zap_entries(&self, zap_dnode: &DNodePhys) -> Result<Vec<(String, ZapValue)>, ZfsError> {
        let block = self.ctx.read_block(zap_dnode, 0)?;
        let block_size = zap_dnode.header.datablkszsec as usize * 512;
        let (_, header) = ZapBlock::parse(&block, block_size)?;
        match header {
            ZapBlock::Micro(micro) => Ok(micro
                .entries()
                .into_iter()
                .map(|(key, value)| (key, ZapValue::U64(vec![value])))
                .collect()),
            ZapBlock::FatHeader(header) => {
                let mut block_list: Vec<u64> = if header.ptrtbl.blk == 0 {
                    header.leafs.iter().copied().filter(|p| *p != 0).collect()
                } else {
                    let mut out = Vec::new();
                    for i in 0..header.ptrtbl.numblks {
                        let block = self.ctx.read_block(zap_dnode, header.ptrtbl.blk + i)?;
                        let nums = nom::multi::many0(number::le_u64)(block.as_slice())?.1;
                        out.extend(nums.into_iter().filter(|p| *p != 0));
                    }
                    out
                };
                block_list.sort_unstable();
                block_list.dedup();
                let mut out = Vec::new();
                for block_num in block_list {
                    let block = self.ctx.read_block(zap_dnode, block_num)?;
                    let (_, leaf) = ZapLeaf::parse(&block, block_size)?;
                    out.extend(leaf.entries());
                }
                Ok(out)
            }
            ZapBlock::FatLeaf(_) => Err(ZfsErrorKind::Invalid.into()),
        }
    }

    /// An object-array object as its run of u64s.
    pub fn object_array(&self, dnode: &DNodePhys) -> Result<Vec<u64>, ZfsError> {
        let data = self.read(dnode)?;
        let out = nom::multi::many0(number::le_u64)(data.as_slice())?.1;
        Ok(out)
    }

    /// A packed-nvlist object decoded in one go.
    pub fn packed_nvlist(&self, dnode: &DNodePhys) -> Result<NvList, ZfsError> {
        let data = self.read(dnode)?;
        NvList::unpack(&data)
    }

    /// The leading block pointers of a bpobj.
    pub fn bpobj_blkptrs(
        &self,
        dnode: &DNodePhys,
        num_blkptrs: u64,
    ) -> Result<Vec<BlockPtr>, ZfsError> {
        let data = self.read(dnode)?;
        let wanted = (num_blkptrs as usize).min(data.len() / BLOCK_PTR_SIZE);
        let mut out = Vec::with_capacity(wanted);
        for chunk in data.chunks_exact(BLOCK_PTR_SIZE).take(wanted) {
            out.push(BlockPtr::parse(chunk)?.1);
        }
        Ok(out)
    }

    /// The system-attribute registration table: attribute names with
    /// their packed encodings.
    pub fn attr_registrations(
        &self,
        zap_dnode: &DNodePhys,
    ) -> Result<Vec<(String, SaAttrPhys)>, ZfsError> {
        Ok(self
            .zap_entries(zap_dnode)?
            .into_iter()
            .filter_map(|(name, value)| Some((name, SaAttrPhys(value.as_u64()?))))
            .collect())
    }

    /// Object number of the filesystem root directory, from the master
    /// node.
    pub fn root_directory(&self) -> Result<u64, ZfsError> {
        let master = self.dnode(MASTER_NODE_OBJECT)?;
        self.zap_lookup(&master, MASTER_NODE_ROOT.as_bytes())?
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ZfsErrorKind::NotFound.into())
    }

    /// Entries of a directory object, decoded.
    pub fn directory_entries(
        &self,
        dir_dnode: &DNodePhys,
    ) -> Result<Vec<(String, DirEntry)>, ZfsError> {
        Ok(self
            .zap_entries(dir_dnode)?
            .into_iter()
            .filter_map(|(name, value)| Some((name, DirEntry(value.as_u64()?))))
            .collect())
    }
}

/// A live dataset: its DSL directory and head dataset, with lazy access
/// to children, snapshots and the object set.
pub struct Dataset<'a, D: RawDevice> {
    pool: &'a Pool<D>,
    pub name: String,
    pub dir: DirPhys,
    pub dataset: DatasetPhys,
    children: RefCell<Option<BTreeMap<String, u64>>>,
}

impl<'a, D: RawDevice> Dataset<'a, D> {
    /// Child datasets are listed once per dataset and cached.
    fn ensure_children(&self) -> Result<(), ZfsError> {
        if self.children.borrow().is_some() {
            return Ok(());
        }
        let mut map = BTreeMap::new();
        if self.dir.child_dir_zapobj != 0 {
            let mos = self.pool.mos();
            let zap = mos.dnode(self.dir.child_dir_zapobj)?;
            for (name, value) in mos.zap_entries(&zap)? {
                if let Some(obj) = value.as_u64() {
                    map.insert(name, obj);
                }
            }
        }
        *self.children.borrow_mut() = Some(map);
        Ok(())
    }

    pub fn child_names(&self) -> Result<Vec<String>, ZfsError> {
        self.ensure_children()?;
        Ok(self
            .children
            .borrow()
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    pub fn child(&self, name: &str) -> Result<Option<Dataset<'a, D>>, ZfsError> {
        self.ensure_children()?;
        let obj = match self.children.borrow().as_ref().and_then(|m| m.get(name)) {
            Some(&obj) => obj,
            None => return Ok(None),
        };
        let child = self
            .pool
            .dataset_from_dir_obj(format!("{}/{}", self.name, name), obj)?;
        Ok(Some(child))
    }

    pub fn snapshot_names(&self) -> Result<Vec<String>, ZfsError> {
        if self.dataset.snapnames_zapobj == 0 {
            return Ok(Vec::new());
        }
        let mos = self.pool.mos();
        let zap = mos.dnode(self.dataset.snapnames_zapobj)?;
        Ok(mos
            .zap_entries(&zap)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Open this dataset's object set.
    pub fn object_set(&self) -> Result<ObjectSet<'a, D>, ZfsError> {
        let ctx = self.pool.read_context();
        let root = ctx.resolve(&self.dataset.bp, &ReadProps::default())?;
        let (_, phys) = ObjsetPhys::parse(&root)?;
        Ok(ObjectSet { ctx, phys })
    }
}
