use crate::error::LogResult;
use crate::log::{Log, LogReader, Record};

/// Storage capability shared by the user-data log and the consensus log.
///
/// Both consensus adapters are written against this trait rather than the
/// concrete segmented [`Log`].
pub trait LogStorage: Send + Sync + 'static {
    fn append(&self, record: Record) -> LogResult<u64>;

    fn read(&self, offset: u64) -> LogResult<Record>;

    fn lowest_offset(&self) -> u64;

    fn highest_offset(&self) -> u64;

    /// Drops every record at or below `lowest`.
    fn truncate(&self, lowest: u64) -> LogResult<()>;

    fn next_offset(&self) -> u64;

    /// Drops every record at or above `from`.
    fn truncate_suffix(&self, from: u64) -> LogResult<()>;

    /// Discards everything; the next append gets `initial_offset`.
    fn reset_to(&self, initial_offset: u64) -> LogResult<()>;

    fn reader(&self) -> LogResult<LogReader>;

    fn flush(&self) -> LogResult<()>;

    fn close(&self) -> LogResult<()>;
}

impl LogStorage for Log {
    fn append(&self, record: Record) -> LogResult<u64> {
        Log::append(self, record)
    }

    fn read(&self, offset: u64) -> LogResult<Record> {
        Log::read(self, offset)
    }

    fn lowest_offset(&self) -> u64 {
        Log::lowest_offset(self)
    }

    fn highest_offset(&self) -> u64 {
        Log::highest_offset(self)
    }

    fn truncate(&self, lowest: u64) -> LogResult<()> {
        Log::truncate(self, lowest)
    }

    fn next_offset(&self) -> u64 {
        Log::next_offset(self)
    }

    fn truncate_suffix(&self, from: u64) -> LogResult<()> {
        Log::truncate_suffix(self, from)
    }

    fn reset_to(&self, initial_offset: u64) -> LogResult<()> {
        Log::reset_to(self, initial_offset)
    }

    fn reader(&self) -> LogResult<LogReader> {
        Log::reader(self)
    }

    fn flush(&self) -> LogResult<()> {
        Log::flush(self)
    }

    fn close(&self) -> LogResult<()> {
        Log::close(self)
    }
}
