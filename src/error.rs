/// The error type for table construction and mutation.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `bucket_count` or `cell_count` was not a power of two. Mask-based
    /// addressing requires both, so this is rejected at construction rather
    /// than silently rounded.
    #[error(
        "bucket_count ({bucket_count}) and cell_count ({cell_count}) \
         must both be non-zero powers of two"
    )]
    Config {
        bucket_count: usize,
        cell_count: usize,
    },

    /// A bucket could not host the key even after doubling its cell array.
    /// The caller may retry after a full-table `minor_rehash_all`, or reject
    /// the write.
    #[error("bucket {bucket} cannot host the key within the probe bound, even after rehash")]
    TableFull { bucket: u32 },

    /// The underlying memory (or persistent pool) could not satisfy an
    /// allocation request.
    #[error("allocation of {size} bytes failed")]
    Allocation { size: usize },

    /// The persistent pool has no root to recover from, or its root is not
    /// a table descriptor this build understands.
    #[error("persistent pool recovery failed: {reason}")]
    Recovery { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
