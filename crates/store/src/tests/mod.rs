mod helpers;

mod compaction_tests;
mod read_tests;
mod recovery_tests;
mod snapshot_tests;
