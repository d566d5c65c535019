//! Canonical identifier types used across queueing, catalog, and execution.

/// Cluster-unique transaction identifier. The numeric order of ids is the
/// global commit-precedence order.
pub type TxnId = u64;

/// Numeric partition identifier inside a cluster.
pub type PartitionId = u32;

/// Identifier of one site (process) hosting a group of partitions.
pub type SiteId = u32;

/// Catalog identifier of a stored procedure.
pub type ProcId = u16;

/// Catalog identifier of a table.
pub type TableId = u16;

/// Catalog identifier of a statement inside a procedure.
pub type StmtId = u16;

/// Catalog identifier of a column inside a table.
pub type ColumnId = u16;

/// Low bits of a transaction id reserved for the originating site, so ids
/// minted by different sites never collide and the id total order breaks
/// ties by site.
pub const SITE_ID_BITS: u32 = 10;

/// Composes a cluster-unique transaction id from a site-local counter.
#[must_use]
pub const fn compose_txn_id(counter: u64, site: SiteId) -> TxnId {
    (counter << SITE_ID_BITS) | (site as u64 & ((1 << SITE_ID_BITS) - 1))
}

/// Extracts the originating site from a transaction id.
#[must_use]
pub const fn txn_id_site(txn_id: TxnId) -> SiteId {
    (txn_id & ((1 << SITE_ID_BITS) - 1)) as SiteId
}

/// Strongly typed partition-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u32);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero because every site owns at least one partition.
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Iterates all partition ids below this count.
    pub fn iter(self) -> impl Iterator<Item = PartitionId> {
        0..self.0
    }
}
