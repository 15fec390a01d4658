#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![forbid(unsafe_code)]

pub mod authors;
pub mod cli;
pub mod errors;
pub mod git;
pub mod importer;
pub mod rules;
pub mod svn;
pub mod term_out;

pub(crate) type FHashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub(crate) type FHashSet<T> = std::collections::HashSet<T, rustc_hash::FxBuildHasher>;
