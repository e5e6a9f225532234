//! Append-only event log with group commit.
//!
//! Each record on disk is a frame: `[u32 le: payload len][payload][u32 le: crc32(payload)]`,
//! where the payload is the bincode encoding of one store event. Replay stops at the
//! first frame that is short or fails its checksum, which is what a crash mid-write
//! leaves behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::store::StoreError;

const FRAME_OVERHEAD: usize = 8;
/// Largest payload a frame may carry. A length word above this is read as
/// damage, not as a request to allocate.
const MAX_FRAME: usize = 16 * 1024 * 1024;
const COMMAND_QUEUE: usize = 4096;
const MAX_DRAIN: usize = 1024;

fn frame<E: Serialize>(event: &E) -> io::Result<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large for a frame"));
    }
    let len = payload.len() as u32;
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    Ok(buf)
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, or `None` at end of log or at a torn/corrupt frame.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// A single log file. Not synchronized; [`WalHandle`] gives shared async access.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open for appending as-is. Callers with a possibly damaged file use
    /// [`Wal::recover`].
    fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(Self::open_for_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_for_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Intact events and the byte length of the prefix holding them.
    fn scan<E: DeserializeOwned>(path: &Path) -> io::Result<(Vec<E>, u64)> {
        let mut reader = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut events = Vec::new();
        let mut intact = 0u64;
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
            intact += (payload.len() + FRAME_OVERHEAD) as u64;
        }
        Ok((events, intact))
    }

    /// Read every intact event without touching the file. A missing file is
    /// an empty log.
    pub fn replay<E: DeserializeOwned>(path: &Path) -> io::Result<Vec<E>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay `path`, cut any torn or corrupt tail off the file, then open it
    /// for appending. New frames always follow the last intact one, so they
    /// are readable on the next replay.
    pub fn recover<E: DeserializeOwned>(path: &Path) -> io::Result<(Vec<E>, Self)> {
        let (events, intact) = Self::scan(path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact {
            tracing::warn!(
                path = %path.display(),
                kept_bytes = intact,
                dropped_bytes = on_disk - intact,
                "truncating unreadable log tail"
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }
        drop(file);
        Ok((events, Self::open(path)?))
    }

    /// Buffer one event. Nothing is durable until [`Wal::sync`].
    fn stage<E: Serialize>(&mut self, event: &E) -> io::Result<()> {
        self.out.write_all(&frame(event)?)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    /// Replace the whole log with `events`: write a sibling file, fsync it,
    /// then rename it over the live one.
    fn rewrite<E: Serialize>(&mut self, events: &[E]) -> io::Result<()> {
        let staging = self.path.with_extension("compacting");
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for event in events {
                out.write_all(&frame(event)?)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.out = BufWriter::new(Self::open_for_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }
}

// ── Group-commit writer ──────────────────────────────────

type Reply<T> = oneshot::Sender<T>;

enum Command<E> {
    Append(E, Reply<io::Result<()>>),
    Rewrite(Vec<E>, Reply<io::Result<()>>),
    Count(Reply<u64>),
}

/// Handle to a background task that owns a [`Wal`]. Concurrent appends that
/// arrive together share one fsync.
pub struct WalHandle<E> {
    tx: mpsc::Sender<Command<E>>,
}

impl<E> WalHandle<E>
where
    E: Serialize + Send + 'static,
{
    /// Must be called from inside a tokio runtime.
    pub fn spawn(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(writer_task(wal, rx));
        Self { tx }
    }

    async fn request<T>(&self, cmd: Command<E>, rx: oneshot::Receiver<T>) -> Result<T, StoreError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::Unavailable("log writer has stopped".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("log writer dropped the request".into()))
    }

    /// Resolves once the batch holding `event` is on disk.
    pub async fn append(&self, event: E) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Append(event, tx), rx)
            .await?
            .map_err(|e| StoreError::Unavailable(format!("log append: {e}")))
    }

    /// Replace the log contents with `events`.
    pub async fn compact(&self, events: Vec<E>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Rewrite(events, tx), rx)
            .await?
            .map_err(|e| StoreError::Unavailable(format!("log compaction: {e}")))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        self.request(Command::Count(tx), rx).await.unwrap_or(0)
    }
}

async fn writer_task<E: Serialize>(mut wal: Wal, mut rx: mpsc::Receiver<Command<E>>) {
    let mut inbox = Vec::with_capacity(MAX_DRAIN);
    let mut waiting: Vec<Reply<io::Result<()>>> = Vec::new();

    while rx.recv_many(&mut inbox, MAX_DRAIN).await > 0 {
        // Commands run in arrival order; each run of appends is synced once.
        for cmd in inbox.drain(..) {
            match cmd {
                Command::Append(event, reply) => match wal.stage(&event) {
                    Ok(()) => waiting.push(reply),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                },
                Command::Rewrite(events, reply) => {
                    commit(&mut wal, &mut waiting);
                    let _ = reply.send(wal.rewrite(&events));
                }
                Command::Count(reply) => {
                    commit(&mut wal, &mut waiting);
                    let _ = reply.send(wal.appends_since_compact);
                }
            }
        }
        commit(&mut wal, &mut waiting);
    }
}

fn commit(wal: &mut Wal, waiting: &mut Vec<Reply<io::Result<()>>>) {
    if waiting.is_empty() {
        return;
    }
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(waiting.len() as f64);
    let started = Instant::now();
    let result = wal.sync();
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(path = %wal.path.display(), batch = waiting.len(), "log sync failed: {e}");
    }
    for reply in waiting.drain(..) {
        let _ = reply.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::sync::Arc;
    use ulid::Ulid;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("tutorslot_wal_tests");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}-{}.wal", Ulid::new()));
        let _ = fs::remove_file(&path);
        path
    }

    fn opened(owner: &str, start: Ms, end: Ms) -> WindowEvent {
        WindowEvent::Put {
            window: AvailabilityWindow::open(Ulid::new(), owner, Span::new(start, end)),
        }
    }

    fn write_synced(path: &Path, events: &[WindowEvent]) {
        let mut wal = Wal::open(path).unwrap();
        for e in events {
            wal.stage(e).unwrap();
        }
        wal.sync().unwrap();
    }

    #[test]
    fn events_survive_reopen() {
        let path = scratch("reopen");
        let id = Ulid::new();
        let events = vec![
            opened("tutor-1", 1000, 2000),
            WindowEvent::Held { id, owner_id: "tutor-1".into(), at: 1500 },
            WindowEvent::Released { id, owner_id: "tutor-1".into() },
        ];
        write_synced(&path, &events);

        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), events);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = scratch("torn");
        let first = opened("tutor-1", 1000, 2000);
        write_synced(&path, std::slice::from_ref(&first));

        // A length word promising more bytes than were written.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&64u32.to_le_bytes()).unwrap();
        f.write_all(&[7u8; 10]).unwrap();
        drop(f);

        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), vec![first]);
    }

    #[test]
    fn corrupt_frame_hides_everything_after_it() {
        let path = scratch("corrupt");
        let good = opened("tutor-1", 0, 10);
        let mut bad = frame(&opened("tutor-1", 10, 20)).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;

        let mut bytes = frame(&good).unwrap();
        bytes.extend_from_slice(&bad);
        bytes.extend_from_slice(&frame(&opened("tutor-1", 20, 30)).unwrap());
        fs::write(&path, bytes).unwrap();

        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), vec![good]);
    }

    #[test]
    fn recover_drops_torn_tail_so_later_appends_replay() {
        let path = scratch("recover");
        let first = opened("tutor-1", 1000, 2000);
        write_synced(&path, std::slice::from_ref(&first));

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&64u32.to_le_bytes()).unwrap();
        f.write_all(&[7u8; 5]).unwrap();
        drop(f);

        let (events, mut wal) = Wal::recover::<WindowEvent>(&path).unwrap();
        assert_eq!(events, vec![first.clone()]);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            frame(&first).unwrap().len() as u64
        );

        let second = opened("tutor-1", 2000, 3000);
        wal.stage(&second).unwrap();
        wal.sync().unwrap();
        drop(wal);

        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), vec![first, second]);
    }

    #[test]
    fn recover_leaves_clean_log_alone() {
        let path = scratch("recover_clean");
        let events = vec![opened("tutor-1", 0, 10), opened("tutor-1", 10, 20)];
        write_synced(&path, &events);
        let before = fs::metadata(&path).unwrap().len();

        let (replayed, _wal) = Wal::recover::<WindowEvent>(&path).unwrap();
        assert_eq!(replayed, events);
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }

    #[test]
    fn oversized_length_word_reads_as_damage() {
        let path = scratch("oversized");
        let good = opened("tutor-1", 0, 10);
        let mut bytes = frame(&good).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 16]);
        fs::write(&path, bytes).unwrap();

        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), vec![good]);
    }

    #[test]
    fn missing_file_replays_empty() {
        let path = scratch("missing");
        assert!(Wal::replay::<BookingEvent>(&path).unwrap().is_empty());
    }

    #[test]
    fn rewrite_resets_count_and_keeps_appending() {
        let path = scratch("rewrite");
        let kept = opened("tutor-1", 0, 1000);
        let after = opened("tutor-1", 1000, 2000);

        let mut wal = Wal::open(&path).unwrap();
        for i in 0..10 {
            wal.stage(&opened("tutor-1", i, i + 1)).unwrap();
        }
        wal.sync().unwrap();
        assert_eq!(wal.appends_since_compact, 10);

        wal.rewrite(std::slice::from_ref(&kept)).unwrap();
        assert_eq!(wal.appends_since_compact, 0);
        assert!(!path.with_extension("compacting").exists());

        wal.stage(&after).unwrap();
        wal.sync().unwrap();
        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap(), vec![kept, after]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_land() {
        let path = scratch("group");
        let handle = Arc::new(WalHandle::<WindowEvent>::spawn(Wal::open(&path).unwrap()));

        let mut tasks = Vec::new();
        for i in 0..64 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.append(opened("tutor-1", i * 10, i * 10 + 5)).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(handle.appends_since_compact().await, 64);
        assert_eq!(Wal::replay::<WindowEvent>(&path).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn compaction_through_handle() {
        let path = scratch("handle_compact");
        let handle = WalHandle::<WindowEvent>::spawn(Wal::open(&path).unwrap());
        for i in 0..5 {
            handle.append(opened("tutor-1", i, i + 1)).await.unwrap();
        }
        let survivor = opened("tutor-2", 0, 10);
        handle.compact(vec![survivor.clone()]).await.unwrap();
        assert_eq!(handle.appends_since_compact().await, 0);

        handle.append(opened("tutor-2", 10, 20)).await.unwrap();
        let replayed = Wal::replay::<WindowEvent>(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], survivor);
    }
}
