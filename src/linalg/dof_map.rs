use faer::sparse::Triplet;
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

/// capacity of the derivative seed directions; no element may couple more
/// DOFs than this
pub const MAX_SEED_DIRECTIONS: usize = 64;

/////////////////////////////////////////////////////////////////////////////////////////////
//                COMMUNICATOR
/////////////////////////////////////////////////////////////////////////////////////////////

/// reduction/rank queries of an SPMD world
pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn sum(&self, local: f64) -> f64;
    fn min(&self, local: f64) -> f64;
    fn max(&self, local: f64) -> f64;
    fn sum_vec(&self, local: &DVector<f64>) -> DVector<f64>;
}

/// single-process world: every reduction is the identity
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn sum(&self, local: f64) -> f64 {
        local
    }
    fn min(&self, local: f64) -> f64 {
        local
    }
    fn max(&self, local: f64) -> f64 {
        local
    }
    fn sum_vec(&self, local: &DVector<f64>) -> DVector<f64> {
        local.clone()
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                DOF MAP
/////////////////////////////////////////////////////////////////////////////////////////////

/// owned and overlapped (owned plus halo) global id layouts of one process
#[derive(Debug, Clone)]
pub struct DofMap {
    pub owned: Vec<usize>,
    pub overlapped: Vec<usize>,
    owned_lid: HashMap<usize, usize>,
    overlapped_lid: HashMap<usize, usize>,
}

impl DofMap {
    pub fn new(owned: Vec<usize>, overlapped: Vec<usize>) -> DofMap {
        assert!(!owned.is_empty(), "Owned map should not be empty.");
        let owned_lid: HashMap<usize, usize> =
            owned.iter().enumerate().map(|(i, &g)| (g, i)).collect();
        let overlapped_lid: HashMap<usize, usize> =
            overlapped.iter().enumerate().map(|(i, &g)| (g, i)).collect();
        assert_eq!(
            owned_lid.len(),
            owned.len(),
            "Owned map should not contain duplicate global ids."
        );
        assert_eq!(
            overlapped_lid.len(),
            overlapped.len(),
            "Overlapped map should not contain duplicate global ids."
        );
        for g in owned.iter() {
            assert!(
                overlapped_lid.contains_key(g),
                "Every owned global id must also be in the overlapped map."
            );
        }
        DofMap {
            owned,
            overlapped,
            owned_lid,
            overlapped_lid,
        }
    }

    /// serial map: overlapped and owned both cover 0..n
    pub fn serial(n: usize) -> DofMap {
        let ids: Vec<usize> = (0..n).collect();
        DofMap::new(ids.clone(), ids)
    }

    pub fn num_owned(&self) -> usize {
        self.owned.len()
    }

    pub fn num_overlapped(&self) -> usize {
        self.overlapped.len()
    }

    pub fn owned_local(&self, gid: usize) -> Option<usize> {
        self.owned_lid.get(&gid).copied()
    }

    pub fn overlapped_local(&self, gid: usize) -> Option<usize> {
        self.overlapped_lid.get(&gid).copied()
    }

    /// fatal precondition on the element footprint
    pub fn check_element_width(&self, elem_dofs: usize) {
        assert!(
            elem_dofs <= MAX_SEED_DIRECTIONS,
            "element couples {} degrees of freedom but the derivative seed capacity is {}",
            elem_dofs,
            MAX_SEED_DIRECTIONS
        );
    }
}

/////////////////////////////////////////////////////////////////////////////////////////////
//                EXCHANGE (EXPORT / IMPORT)
/////////////////////////////////////////////////////////////////////////////////////////////

/// moves data between the overlapped and owned layouts of a DofMap;
/// the two buffers are always distinct objects, also in a serial run
pub struct Exchange {
    pub map: DofMap,
}

impl Exchange {
    pub fn new(map: DofMap) -> Exchange {
        Exchange { map }
    }

    /// overlapped -> owned with add-combine; the owned target is zeroed
    /// first so each overlapped contribution lands exactly once
    pub fn export_add(&self, overlapped: &DVector<f64>, owned: &mut DVector<f64>) {
        assert_eq!(overlapped.len(), self.map.num_overlapped());
        assert_eq!(owned.len(), self.map.num_owned());
        owned.fill(0.0);
        for (lid, &gid) in self.map.overlapped.iter().enumerate() {
            if let Some(olid) = self.map.owned_local(gid) {
                owned[olid] += overlapped[lid];
            }
        }
    }

    /// column-wise export of a multi-column (seeded) residual
    pub fn export_add_mat(&self, overlapped: &DMatrix<f64>, owned: &mut DMatrix<f64>) {
        assert_eq!(overlapped.nrows(), self.map.num_overlapped());
        assert_eq!(owned.nrows(), self.map.num_owned());
        assert_eq!(overlapped.ncols(), owned.ncols());
        owned.fill(0.0);
        for (lid, &gid) in self.map.overlapped.iter().enumerate() {
            if let Some(olid) = self.map.owned_local(gid) {
                for c in 0..overlapped.ncols() {
                    owned[(olid, c)] += overlapped[(lid, c)];
                }
            }
        }
    }

    /// export Jacobian triplets from overlapped-local to owned-local
    /// indexing. Entries whose row or column gid is not locally owned are
    /// dropped, so the owned matrix stays square over the owned ids;
    /// halo-row and halo-column entries are assembled by the owning
    /// process from its own copy of the element. With a serial map the
    /// owned and overlapped layouts coincide and nothing is dropped.
    pub fn export_add_triplets(
        &self,
        triplets: &Vec<Triplet<usize, usize, f64>>,
    ) -> Vec<Triplet<usize, usize, f64>> {
        let mut owned_triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
        for t in triplets.iter() {
            let rgid = self.map.overlapped[t.row];
            let cgid = self.map.overlapped[t.col];
            if let (Some(r), Some(c)) = (self.map.owned_local(rgid), self.map.owned_local(cgid)) {
                owned_triplets.push(Triplet::new(r, c, t.val));
            }
        }
        owned_triplets
    }

    /// owned -> overlapped broadcast; halo entries of another owner are
    /// left untouched (a serial map has none)
    pub fn import(&self, owned: &DVector<f64>, overlapped: &mut DVector<f64>) {
        assert_eq!(overlapped.len(), self.map.num_overlapped());
        assert_eq!(owned.len(), self.map.num_owned());
        for (lid, &gid) in self.map.overlapped.iter().enumerate() {
            if let Some(olid) = self.map.owned_local(gid) {
                overlapped[lid] = owned[olid];
            }
        }
    }

    /// restrict an overlapped vector to its owned entries (no combine)
    pub fn owned_view(&self, overlapped: &DVector<f64>) -> DVector<f64> {
        let mut owned = DVector::zeros(self.map.num_owned());
        for (olid, &gid) in self.map.owned.iter().enumerate() {
            let lid = self
                .map
                .overlapped_local(gid)
                .expect("owned gid missing from overlapped map");
            owned[olid] = overlapped[lid];
        }
        owned
    }
}
