//!
//! RAID-Z stripe geometry and parity reconstruction
//!
//! A RAID-Z block is spread over a variable number of columns: `nparity`
//! parity columns first, then data columns, rotated across the member
//! devices by the stripe's starting offset. Small blocks allocate fewer
//! columns than the vdev is wide, so the geometry must be computed per
//! block, never assumed constant.
//!
use crate::spa::SECTOR_SHIFT;
use crate::{ZfsError, ZfsErrorKind};

/// GF(2^8) multiplication with the RAID-Z generator polynomial x^8 +
/// x^4 + x^3 + x^2 + 1.
fn gf_mul(a: u8, b: u8) -> u8 {
    let mut result = 0u8;
    let mut a = a;
    let mut b = b;
    for _ in 0..8 {
        if b & 1 != 0 {
            result ^= a;
        }
        let high = a & 0x80;
        a <<= 1;
        if high != 0 {
            a ^= 0x1d;
        }
        b >>= 1;
    }
    result
}

fn gf_pow(base: u8, exp: usize) -> u8 {
    let mut result = 1u8;
    for _ in 0..exp {
        result = gf_mul(result, base);
    }
    result
}

/// Multiplicative inverse; the nonzero elements form a group of order
/// 255.
fn gf_inv(a: u8) -> u8 {
    gf_pow(a, 254)
}

/// Generator coefficient applied to data column `j` (of `ndata`) when
/// producing parity row `t` (0 = P, 1 = Q, 2 = R).
fn parity_coefficient(t: usize, j: usize, ndata: usize) -> u8 {
    let base = match t {
        0 => 1,
        1 => 2,
        _ => 4,
    };
    gf_pow(base, ndata - 1 - j)
}

/// One column of a stripe: which child device it lives on, and where.
#[derive(Debug, Clone)]
pub struct RaidzCol {
    pub devidx: usize,
    /// Byte offset within the child's allocatable region.
    pub offset: u64,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct RaidzMap {
    /// Parity columns first, then data columns.
    pub cols: Vec<RaidzCol>,
    pub nparity: usize,
    pub width: usize,
}

impl RaidzMap {
    /// Lay out the columns holding a `psize`-byte block at
    /// `offset_sectors` on a RAID-Z vdev of `width` children with
    /// `nparity` parity columns and allocation unit `1 << ashift`.
    pub fn allocate(
        offset_sectors: u64,
        psize: usize,
        ashift: u32,
        width: usize,
        nparity: usize,
    ) -> Self {
        let unit = 1u64 << ashift;
        let b = (offset_sectors << SECTOR_SHIFT) >> ashift;
        let s = ((psize as u64) + unit - 1) >> ashift;
        let f = b % width as u64;
        let o = (b / width as u64) << ashift;
        let ndata = (width - nparity) as u64;
        let q = s / ndata;
        let r = s % ndata;
        let bc = if r == 0 { 0 } else { r + nparity as u64 };
        let acols = if q == 0 { bc as usize } else { width };

        let mut cols = Vec::with_capacity(acols);
        for c in 0..acols {
            let mut col = f + c as u64;
            let mut coloffset = o;
            if col >= width as u64 {
                col -= width as u64;
                coloffset += unit;
            }
            let rows = q + if (c as u64) < bc { 1 } else { 0 };
            cols.push(RaidzCol {
                devidx: col as usize,
                offset: coloffset,
                size: (rows << ashift) as usize,
            });
        }
        Self {
            cols,
            nparity,
            width,
        }
    }

    pub fn data_cols(&self) -> &[RaidzCol] {
        &self.cols[self.nparity..]
    }

    /// Concatenate the data columns in map order into the logical block.
    pub fn assemble(&self, cols: &[Option<Vec<u8>>], psize: usize) -> Result<Vec<u8>, ZfsError> {
        let mut out = Vec::with_capacity(psize);
        for (meta, data) in self.cols.iter().zip(cols.iter()).skip(self.nparity) {
            match data {
                Some(d) => out.extend_from_slice(&d[..meta.size.min(d.len())]),
                None => return Err(ZfsErrorKind::UnrecoverableStripe.into()),
            }
        }
        out.truncate(psize);
        Ok(out)
    }
}

/// Compute the parity rows for a set of data columns. Shorter columns
/// are treated as zero-padded to `len` (the size of the widest column).
pub fn generate_parity(data: &[&[u8]], nparity: usize, len: usize) -> Vec<Vec<u8>> {
    let ndata = data.len();
    (0..nparity)
        .map(|t| {
            let mut row = vec![0u8; len];
            for (j, col) in data.iter().enumerate() {
                let coeff = parity_coefficient(t, j, ndata);
                for (i, &byte) in col.iter().enumerate() {
                    row[i] ^= gf_mul(byte, coeff);
                }
            }
            row
        })
        .collect()
}

/// Invert an `m`-by-`m` matrix over GF(2^8) by Gauss-Jordan
/// elimination. The reconstruction matrices are Vandermonde-like and
/// always invertible when the geometry is sane.
fn invert_matrix(m: usize, a: &[[u8; 3]; 3]) -> Option<[[u8; 3]; 3]> {
    let mut work = *a;
    let mut inv = [[0u8; 3]; 3];
    for (i, row) in inv.iter_mut().enumerate().take(m) {
        row[i] = 1;
    }
    for col in 0..m {
        let pivot = (col..m).find(|&r| work[r][col] != 0)?;
        work.swap(col, pivot);
        inv.swap(col, pivot);
        let scale = gf_inv(work[col][col]);
        for k in 0..m {
            work[col][k] = gf_mul(work[col][k], scale);
            inv[col][k] = gf_mul(inv[col][k], scale);
        }
        for row in 0..m {
            if row == col || work[row][col] == 0 {
                continue;
            }
            let factor = work[row][col];
            for k in 0..m {
                work[row][k] ^= gf_mul(work[col][k], factor);
                inv[row][k] ^= gf_mul(inv[col][k], factor);
            }
        }
    }
    Some(inv)
}

/// Rebuild every missing data column in `cols` (parity first, aligned
/// with `map.cols`) from the surviving columns. More missing data
/// columns than surviving parity rows is `UnrecoverableStripe`.
pub fn reconstruct(map: &RaidzMap, cols: &mut [Option<Vec<u8>>]) -> Result<(), ZfsError> {
    let nparity = map.nparity;
    let ndata = map.cols.len() - nparity;
    let missing: Vec<usize> = (nparity..map.cols.len())
        .filter(|&j| cols[j].is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let parity_rows: Vec<usize> = (0..nparity).filter(|&t| cols[t].is_some()).collect();
    if missing.len() > parity_rows.len() {
        log::warn!(
            "raidz stripe unrecoverable: {} columns missing, {} parity rows available",
            missing.len(),
            parity_rows.len()
        );
        return Err(ZfsErrorKind::UnrecoverableStripe.into());
    }
    let m = missing.len();
    let rows = &parity_rows[..m];

    let mut matrix = [[0u8; 3]; 3];
    for (ri, &t) in rows.iter().enumerate() {
        for (k, &j) in missing.iter().enumerate() {
            matrix[ri][k] = parity_coefficient(t, j - nparity, ndata);
        }
    }
    let inverse = match invert_matrix(m, &matrix) {
        Some(inv) => inv,
        None => return Err(ZfsErrorKind::UnrecoverableStripe.into()),
    };

    let parity_len = map.cols[rows[0]].size;
    let mut rebuilt: Vec<Vec<u8>> = missing.iter().map(|&j| vec![0u8; map.cols[j].size]).collect();
    for i in 0..parity_len {
        // Parity byte minus the contribution of every surviving data
        // column gives the right-hand side of the linear system.
        let mut rhs = [0u8; 3];
        for (ri, &t) in rows.iter().enumerate() {
            let mut acc = cols[t].as_ref().map(|p| *p.get(i).unwrap_or(&0)).unwrap_or(0);
            for j in nparity..map.cols.len() {
                if missing.contains(&j) {
                    continue;
                }
                let byte = cols[j]
                    .as_ref()
                    .map(|d| *d.get(i).unwrap_or(&0))
                    .unwrap_or(0);
                acc ^= gf_mul(byte, parity_coefficient(t, j - nparity, ndata));
            }
            rhs[ri] = acc;
        }
        for (k, col) in rebuilt.iter_mut().enumerate() {
            if i >= col.len() {
                continue;
            }
            let mut value = 0u8;
            for ri in 0..m {
                value ^= gf_mul(inverse[k][ri], rhs[ri]);
            }
            col[i] = value;
        }
    }
    for (&j, data) in missing.iter().zip(rebuilt.into_iter()) {
        cols[j] = Some(data);
    }
    log::debug!("raidz reconstructed columns {:?}", missing);
    Ok(())
}
