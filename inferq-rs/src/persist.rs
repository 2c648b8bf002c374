//! On-disk KB format.
//!
//! ```text
//! magic "IQKB" · version u32 · nAnswers u64 · nQuestions u64 · nTargets u64
//! α₀ f64
//! A: Q × nAnswers × T doubles, row-major, padding stripped
//! D: Q × T doubles
//! B: T doubles
//! question gap bitmap: word count u64, then words
//! target gap bitmap:   word count u64, then words
//! ```
//!
//! All scalars little-endian; doubles are raw IEEE-754 bit patterns, so a
//! save → load round trip reproduces every cell bit for bit. Load fails
//! with *format mismatch* on magic or version disagreement; the engine
//! facade additionally rejects dimension disagreement with the running
//! instance.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::EngineDimensions;
use crate::engine::ProgressSink;
use crate::error::{EngineError, EngineResult};
use crate::gaps::GapTracker;
use crate::kb::KbStore;

const MAGIC: [u8; 4] = *b"IQKB";
const VERSION: u32 = 1;

pub(crate) struct LoadedKb {
    pub store: KbStore,
    pub question_gaps: GapTracker,
    pub target_gaps: GapTracker,
}

// ----------------------------------------------------------------------
// Little-endian scalar helpers
// ----------------------------------------------------------------------

fn write_u32(w: &mut impl Write, v: u32) -> EngineResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> EngineResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_f64(w: &mut impl Write, v: f64) -> EngineResult<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> EngineResult<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> EngineResult<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> EngineResult<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_len(r: &mut impl Read, what: &str) -> EngineResult<usize> {
    let v = read_u64(r)?;
    usize::try_from(v)
        .ok()
        .filter(|&n| n <= (1usize << 40))
        .ok_or_else(|| EngineError::FormatMismatch(format!("implausible {what}: {v}")))
}

fn write_bitmap(w: &mut impl Write, gaps: &GapTracker) -> EngineResult<()> {
    write_u64(w, gaps.words().len() as u64)?;
    for &word in gaps.words() {
        write_u64(w, word)?;
    }
    Ok(())
}

fn read_bitmap(r: &mut impl Read, len: usize) -> EngineResult<GapTracker> {
    let n_words = read_len(r, "bitmap word count")?;
    let expected = len.div_ceil(64);
    if n_words != expected {
        return Err(EngineError::FormatMismatch(format!(
            "bitmap has {n_words} words, dimensions require {expected}"
        )));
    }
    let mut words = Vec::with_capacity(n_words);
    for _ in 0..n_words {
        words.push(read_u64(r)?);
    }
    Ok(GapTracker::from_words(words, len))
}

// ----------------------------------------------------------------------
// Save / load
// ----------------------------------------------------------------------

/// Write the KB to `path`. Progress counts serialized questions.
pub(crate) fn save(
    store: &KbStore,
    question_gaps: &GapTracker,
    target_gaps: &GapTracker,
    path: &Path,
    progress: Option<ProgressSink<'_>>,
) -> EngineResult<()> {
    let dims = store.dims();
    let mut w = BufWriter::new(File::create(path)?);

    w.write_all(&MAGIC)?;
    write_u32(&mut w, VERSION)?;
    write_u64(&mut w, dims.n_answers as u64)?;
    write_u64(&mut w, dims.n_questions as u64)?;
    write_u64(&mut w, dims.n_targets as u64)?;
    write_f64(&mut w, store.init_amount())?;

    let total = dims.n_questions as u64;
    for q in 0..dims.n_questions {
        for a in 0..dims.n_answers {
            let row = store.a_row(q, a);
            for t in 0..dims.n_targets {
                write_f64(&mut w, row[t].get())?;
            }
        }
        if let Some(report) = progress {
            report(q as u64 + 1, total);
        }
    }
    for q in 0..dims.n_questions {
        let row = store.d_row(q);
        for t in 0..dims.n_targets {
            write_f64(&mut w, row[t].get())?;
        }
    }
    for t in 0..dims.n_targets {
        write_f64(&mut w, store.cell_b(t).get())?;
    }

    write_bitmap(&mut w, question_gaps)?;
    write_bitmap(&mut w, target_gaps)?;
    w.flush()?;
    log::info!(
        "saved KB ({} questions, {} targets) to {}",
        dims.n_questions,
        dims.n_targets,
        path.display()
    );
    Ok(())
}

/// Read a KB from `path`. Progress counts deserialized questions.
pub(crate) fn load(path: &Path, progress: Option<ProgressSink<'_>>) -> EngineResult<LoadedKb> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(EngineError::FormatMismatch(format!(
            "bad magic {magic:02x?}, expected {MAGIC:02x?}"
        )));
    }
    let version = read_u32(&mut r)?;
    if version != VERSION {
        return Err(EngineError::FormatMismatch(format!(
            "unsupported version {version}, expected {VERSION}"
        )));
    }
    let dims = EngineDimensions {
        n_answers: read_len(&mut r, "answer count")?,
        n_questions: read_len(&mut r, "question count")?,
        n_targets: read_len(&mut r, "target count")?,
    };
    dims.validate()
        .map_err(|e| EngineError::FormatMismatch(e.to_string()))?;
    let init_amount = read_f64(&mut r)?;
    if !(init_amount > 0.0 && init_amount.is_finite()) {
        return Err(EngineError::FormatMismatch(format!(
            "initial amount must be positive and finite, got {init_amount}"
        )));
    }

    let store = KbStore::new(dims, init_amount);
    let total = dims.n_questions as u64;
    for q in 0..dims.n_questions {
        for a in 0..dims.n_answers {
            let row = store.a_row(q, a);
            for t in 0..dims.n_targets {
                row[t].set(read_f64(&mut r)?);
            }
        }
        if let Some(report) = progress {
            report(q as u64 + 1, total);
        }
    }
    for q in 0..dims.n_questions {
        let row = store.d_row(q);
        for t in 0..dims.n_targets {
            row[t].set(read_f64(&mut r)?);
        }
    }
    for t in 0..dims.n_targets {
        store.cell_b(t).set(read_f64(&mut r)?);
    }

    let question_gaps = read_bitmap(&mut r, dims.n_questions)?;
    let target_gaps = read_bitmap(&mut r, dims.n_targets)?;
    log::info!(
        "loaded KB ({} questions, {} targets) from {}",
        dims.n_questions,
        dims.n_targets,
        path.display()
    );
    Ok(LoadedKb {
        store,
        question_gaps,
        target_gaps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("inferq-persist-{}-{name}.kb", std::process::id()));
        p
    }

    fn sample_store() -> (KbStore, GapTracker, GapTracker) {
        let dims = EngineDimensions {
            n_answers: 3,
            n_questions: 4,
            n_targets: 5,
        };
        let store = KbStore::new(dims, 0.25);
        store.cell_a(1, 2, 3).add(7.5);
        store.cell_d(1, 3).add(7.5);
        store.cell_b(3).add(1.25);
        let mut qg = GapTracker::new_full(4);
        qg.release(2);
        let tg = GapTracker::new_full(5);
        (store, qg, tg)
    }

    #[test]
    fn test_round_trip_bit_for_bit() {
        let (store, qg, tg) = sample_store();
        let path = temp_path("roundtrip");
        save(&store, &qg, &tg, &path, None).unwrap();
        let loaded = load(&path, None).unwrap();

        assert_eq!(loaded.store.dims(), store.dims());
        assert_eq!(loaded.store.init_amount(), store.init_amount());
        for q in 0..4 {
            for a in 0..3 {
                for t in 0..5 {
                    assert_eq!(
                        loaded.store.cell_a(q, a, t).get().to_bits(),
                        store.cell_a(q, a, t).get().to_bits(),
                        "A[{q},{a},{t}]"
                    );
                }
            }
            for t in 0..5 {
                assert_eq!(
                    loaded.store.cell_d(q, t).get().to_bits(),
                    store.cell_d(q, t).get().to_bits()
                );
            }
        }
        for t in 0..5 {
            assert_eq!(
                loaded.store.cell_b(t).get().to_bits(),
                store.cell_b(t).get().to_bits()
            );
        }
        assert!(loaded.question_gaps.is_gap(2));
        assert_eq!(loaded.question_gaps.gap_count(), 1);
        assert_eq!(loaded.target_gaps.gap_count(), 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bad_magic_rejected() {
        let path = temp_path("badmagic");
        std::fs::write(&path, b"NOPE0000000000000000000000000000").unwrap();
        assert!(matches!(
            load(&path, None),
            Err(EngineError::FormatMismatch(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_truncated_file_is_io_error() {
        let (store, qg, tg) = sample_store();
        let path = temp_path("truncated");
        save(&store, &qg, &tg, &path, None).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(load(&path, None), Err(EngineError::Io(_))));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_progress_reported() {
        let (store, qg, tg) = sample_store();
        let path = temp_path("progress");
        let calls = std::sync::atomic::AtomicU64::new(0);
        let sink = |_done: u64, _total: u64| {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        };
        save(&store, &qg, &tg, &path, Some(&sink)).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 4);
        std::fs::remove_file(&path).ok();
    }
}
