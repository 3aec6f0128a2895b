// On-disk data contracts: the briefing file format, the lightweight
// per-session status file, and the compaction marker. Pure parse/generate —
// no I/O lives here, matching the status machine's pure-function style.

pub mod compaction_marker;
pub mod status_file;
pub mod status_v5;
