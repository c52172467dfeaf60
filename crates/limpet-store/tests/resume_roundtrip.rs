use anyhow::Result;
use limpet_store::{control_file_path, ControlState};
use tempfile::TempDir;

const TOTAL: u64 = 100_000;
const PIECE_LEN: u32 = 16_384;
const IDENTITY: &[u8] = b"sha256:9f86d081884c7d65";

// Drives the state the way a download engine does: ask for a gap, write
// at most `chunk` bytes of it, repeat.
fn drain(state: &mut ControlState, budget: u64, chunk: u64) -> Result<u64> {
    let mut written = 0;
    let mut cursor = 0;
    while written < budget {
        let Some((beg, end)) = state.lack(cursor) else {
            break;
        };
        let stop = end.min(beg + chunk).min(beg + (budget - written));
        written += state.fill(beg, stop)?;
        cursor = stop;
    }
    Ok(written)
}

#[test]
fn download_resumes_across_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let target = dir.path().join("archive.tar.zst");
    let ctrl = control_file_path(&target);

    // first session: download roughly half, then "crash" after a save
    let mut state = ControlState::load_or_new(&ctrl, IDENTITY.to_vec(), PIECE_LEN, TOTAL);
    assert_eq!(state.completed(), 0);

    drain(&mut state, 48_000, 10_000)?;
    let progress = state.completed();
    assert!(progress > 0);
    state.save(&ctrl)?;
    drop(state);

    // second session: progress survives the restart
    let mut state = ControlState::load_or_new(&ctrl, IDENTITY.to_vec(), PIECE_LEN, TOTAL);
    assert_eq!(state.completed(), progress);

    // re-reporting already written ranges adds nothing
    assert_eq!(state.fill(0, 10_000)?, 0);

    // finish the download
    while let Some((beg, end)) = state.lack(0) {
        state.fill(beg, end)?;
    }
    assert!(state.is_complete());
    assert_eq!(state.completed(), TOTAL);
    assert_eq!(state.partial_piece_count(), 0);
    assert_eq!(state.lack(0), None);

    // a completed state round-trips too
    state.save(&ctrl)?;
    let done = ControlState::load_or_new(&ctrl, IDENTITY.to_vec(), PIECE_LEN, TOTAL);
    assert!(done.is_complete());
    Ok(())
}

#[test]
fn partial_piece_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let ctrl = control_file_path(&dir.path().join("image.iso"));

    let mut state = ControlState::new(IDENTITY.to_vec(), PIECE_LEN, TOTAL);
    // lands in the middle of pieces 1 and 2
    state.fill(20_000, 40_000)?;
    assert_eq!(state.partial_piece_count(), 2);
    state.save(&ctrl)?;

    let restored = ControlState::load_or_new(&ctrl, IDENTITY.to_vec(), PIECE_LEN, TOTAL);
    assert_eq!(restored.completed(), state.completed());
    assert_eq!(restored.partial_piece_count(), 2);
    // piece 1 spans [16384, 32768); its gap before the filled range is
    // still clipped to the piece
    assert_eq!(restored.lack(16_384), Some((16_384, 20_000)));
    assert_eq!(restored.lack(20_000), Some((40_000, 49_152)));
    Ok(())
}
