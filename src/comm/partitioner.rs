//! Ownership layout of the degrees of freedom on one rank.

/// Describes which DOFs a rank owns, which ghost copies it holds, and
/// how owned values map onto the ghost slots of neighbouring ranks.
///
/// Local indices run `[0, n_owned)` for owned DOFs followed by
/// `[n_owned, n_owned + n_ghost)` for ghosts. The send plan lists, per
/// neighbour rank, the owned indices to pack (in the order the receiver
/// expects); the receive plan lists the ghost indices to fill, in the
/// order the sender packs them. Both plans are produced by the offline
/// collaborator that distributed the mesh.
#[derive(Clone, Debug)]
pub struct Partitioner {
    rank: usize,
    n_owned: usize,
    n_ghost: usize,
    send_plan: Vec<(usize, Vec<u32>)>,
    recv_plan: Vec<(usize, Vec<u32>)>,
}

impl Partitioner {
    /// Partitioner of a run without peers: every DOF is owned, no halo.
    pub fn single_rank(n_owned: usize) -> Self {
        Self {
            rank: 0,
            n_owned,
            n_ghost: 0,
            send_plan: Vec::new(),
            recv_plan: Vec::new(),
        }
    }

    /// Assemble a partitioner from explicit exchange plans.
    pub fn new(
        rank: usize,
        n_owned: usize,
        n_ghost: usize,
        send_plan: Vec<(usize, Vec<u32>)>,
        recv_plan: Vec<(usize, Vec<u32>)>,
    ) -> Self {
        for (_, indices) in &send_plan {
            debug_assert!(indices.iter().all(|&i| (i as usize) < n_owned));
        }
        let n_local = n_owned + n_ghost;
        for (_, indices) in &recv_plan {
            debug_assert!(indices
                .iter()
                .all(|&i| (i as usize) >= n_owned && (i as usize) < n_local));
        }
        Self {
            rank,
            n_owned,
            n_ghost,
            send_plan,
            recv_plan,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of locally owned DOFs.
    pub fn n_owned(&self) -> usize {
        self.n_owned
    }

    /// Number of ghost DOFs owned by other ranks.
    pub fn n_ghost(&self) -> usize {
        self.n_ghost
    }

    /// Owned plus ghost DOFs; the length of every local vector.
    pub fn n_local(&self) -> usize {
        self.n_owned + self.n_ghost
    }

    /// Per neighbour rank, the owned indices whose values the neighbour
    /// ghosts.
    pub fn send_plan(&self) -> &[(usize, Vec<u32>)] {
        &self.send_plan
    }

    /// Per neighbour rank, the local ghost indices the neighbour's
    /// messages fill.
    pub fn recv_plan(&self) -> &[(usize, Vec<u32>)] {
        &self.recv_plan
    }
}
