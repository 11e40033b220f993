use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use paintfe_core::io;
use paintfe_core::ops::transform::{Anchor, Watermark};
use paintfe_core::persistence::{self, SESSION_VERSION, SessionEntry, SessionFile};
use paintfe_core::{BatchOperation, EngineSettings, PixelRect, RasterDocument, TabId, Workspace};

const WAIT: Duration = Duration::from_secs(60);

fn settings(root: &Path) -> EngineSettings {
    EngineSettings {
        cache_dir: Some(root.join("cache")),
        idle_backup_seconds: 0,
        resize_parallelism: Some(2),
        ..EngineSettings::default()
    }
}

fn source_images(dir: &Path, count: usize) -> Vec<PathBuf> {
    fs::create_dir_all(dir).unwrap();
    (0..count)
        .map(|i| {
            let path = dir.join(format!("img{}.png", i));
            io::write_png(&RasterDocument::filled(40, 30, [i as u8 * 20, 50, 100, 255]), &path).unwrap();
            path
        })
        .collect()
}

#[test]
fn one_missing_source_fails_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 5);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let ids: Vec<TabId> = paths.iter().map(|p| ws.open_file(p).unwrap()).collect();
    let active = ws.active_id().unwrap();
    assert_eq!(active, ids[4]);

    {
        let tab = ws.active_tab_mut().unwrap();
        tab.begin_stroke().unwrap();
        tab.add_dirty_rect(PixelRect::new(0, 0, 2, 2)).unwrap();
        tab.document_mut().unwrap().set_pixel(0, 0, [1, 2, 3, 255]);
        tab.commit_stroke("Pencil").unwrap();
    }
    let active_before = ws.active_tab().unwrap().document().unwrap().clone();
    let active_undo = ws.active_tab().unwrap().history.undo_count();

    fs::remove_file(&paths[1]).unwrap();
    ws.run_batch(BatchOperation::resize(800, 600)).unwrap();
    assert!(ws.is_batch_running());
    assert!(ws.wait_for_background(WAIT));
    assert!(!ws.is_batch_running());

    let report = ws.take_batch_report().unwrap();
    assert_eq!(report.operation, "resize");
    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ids[1]);
    assert!(!report.is_success());

    for &i in &[0usize, 2, 3] {
        let tab = ws.tab(ids[i]).unwrap();
        assert_eq!(tab.last_known_size, (800, 600));
        assert!(tab.is_dirty());
        assert!(!tab.history.can_undo());
        let backup = tab.backup_path.clone().unwrap();
        assert!(backup.starts_with(ws.cache().root()));
        assert!(backup.file_name().unwrap().to_string_lossy().contains("_resize_"));
        assert_eq!(io::load_document(&backup).unwrap().size(), (800, 600));
        assert_eq!(tab.thumbnail.as_ref().unwrap().size(), (256, 192));
        // Source files are never overwritten by a batch.
        assert_eq!(io::load_document(&paths[i]).unwrap().size(), (40, 30));
    }

    let failed = ws.tab(ids[1]).unwrap();
    assert_eq!(failed.last_known_size, (40, 30));
    assert!(failed.backup_path.is_none());
    assert!(!failed.is_dirty());

    let active_tab = ws.active_tab().unwrap();
    assert_eq!(active_tab.id, active);
    assert_eq!(active_tab.document().unwrap(), &active_before);
    assert_eq!(active_tab.history.undo_count(), active_undo);

    let notes = ws.take_notifications();
    assert!(notes.iter().any(|n| n.is_error && n.message.contains("1 failed")));
}

#[test]
fn watermark_result_loads_and_saves() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 2);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let first = ws.open_file(&paths[0]).unwrap();
    ws.open_file(&paths[1]).unwrap();
    ws.new_tab(10, 10).unwrap();

    let mut watermark = Watermark::new(RasterDocument::filled(4, 4, [255, 255, 255, 255]));
    watermark.anchor = Anchor::TopLeft;
    watermark.opacity = 1.0;
    watermark.margin = 0;
    ws.run_batch(BatchOperation::Watermark(watermark)).unwrap();
    assert!(ws.wait_for_background(WAIT));
    let report = ws.take_batch_report().unwrap();
    assert_eq!((report.total, report.succeeded), (2, 2));
    assert!(report.is_success());

    ws.switch_to_tab(first).unwrap();
    let doc = ws.active_tab().unwrap().document().unwrap();
    assert_eq!(doc.size(), (40, 30));
    assert_eq!(doc.pixel(0, 0), Some([255, 255, 255, 255]));
    assert_eq!(doc.pixel(10, 10), Some([0, 50, 100, 255]));

    ws.save_tab(first).unwrap();
    assert!(!ws.tab(first).unwrap().is_dirty());
    assert_eq!(io::load_document(&paths[0]).unwrap().pixel(3, 3), Some([255, 255, 255, 255]));
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn untitled_tab_without_backup_gets_placeholder() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(tmp.path());
    let untitled = SessionEntry {
        id: TabId::new(),
        original_path: None,
        backup_path: None,
        is_dirty: false,
        is_new: true,
        name: "Untitled-3".into(),
        width: 20,
        height: 10,
    };
    let current = SessionEntry {
        id: TabId::new(),
        name: "Untitled-4".into(),
        width: 5,
        height: 5,
        ..untitled.clone()
    };
    let file = SessionFile {
        version: SESSION_VERSION,
        tabs: vec![untitled.clone(), current.clone()],
        retained: Vec::new(),
        active_tab: Some(current.id),
        known_paths: Vec::new(),
        saved_at: Utc::now(),
    };
    persistence::write_session_file(&settings.session_path(), &file).unwrap();

    let mut ws = Workspace::resume(settings).unwrap();
    assert_eq!(ws.active_id(), Some(current.id));
    ws.run_batch(BatchOperation::resize(4, 4)).unwrap();
    assert!(ws.wait_for_background(WAIT));

    let report = ws.take_batch_report().unwrap();
    assert_eq!((report.total, report.succeeded), (1, 1));
    let tab = ws.tab(untitled.id).unwrap();
    assert_eq!(tab.last_known_size, (4, 4));
    // The placeholder was superseded by the batch output.
    assert!(!ws.cache().backup_path(untitled.id).exists());
    assert!(tab.backup_path.as_ref().unwrap().exists());

    let next = ws.new_tab(2, 2).unwrap();
    assert_eq!(ws.tab(next).unwrap().name, "Untitled-5");
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn progress_is_visible_while_running() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 3);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    for p in &paths {
        ws.open_file(p).unwrap();
    }
    ws.run_batch(BatchOperation::resize(20, 20)).unwrap();
    let progress = ws.batch_progress().unwrap();
    assert_eq!(progress.total(), 2);
    assert!(ws.wait_for_background(WAIT));
    assert_eq!(progress.completed(), 2);
    assert_eq!(progress.fraction(), 1.0);
    assert!(ws.batch_progress().is_none());
}

fn cache_has_batch_output(ws: &Workspace, op: &str) -> bool {
    fs::read_dir(ws.cache().root())
        .unwrap()
        .flatten()
        .any(|e| e.file_name().to_string_lossy().contains(&format!("_{}_", op)))
}

#[test]
fn edits_made_while_unit_runs_are_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 2);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let first = ws.open_file(&paths[0]).unwrap();
    ws.open_file(&paths[1]).unwrap();

    ws.run_batch(BatchOperation::resize(8, 8)).unwrap();
    ws.switch_to_tab(first).unwrap();
    {
        let tab = ws.active_tab_mut().unwrap();
        tab.begin_stroke().unwrap();
        tab.add_dirty_rect(PixelRect::new(0, 0, 1, 1)).unwrap();
        tab.document_mut().unwrap().set_pixel(0, 0, [1, 2, 3, 255]);
        tab.commit_stroke("Pencil").unwrap();
    }
    assert!(ws.wait_for_background(WAIT));

    let tab = ws.active_tab().unwrap();
    assert_eq!(tab.document().unwrap().size(), (40, 30));
    assert_eq!(tab.document().unwrap().pixel(0, 0), Some([1, 2, 3, 255]));
    assert!(tab.history.can_undo());

    let report = ws.take_batch_report().unwrap();
    assert_eq!(report.skipped, vec![first]);
    assert_eq!(report.succeeded, 0);
    assert!(!report.is_success());
    assert!(!cache_has_batch_output(&ws, "resize"));
}

#[test]
fn open_stroke_survives_batch_result() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 2);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let first = ws.open_file(&paths[0]).unwrap();
    ws.open_file(&paths[1]).unwrap();

    ws.run_batch(BatchOperation::resize(8, 8)).unwrap();
    ws.switch_to_tab(first).unwrap();
    ws.active_tab_mut().unwrap().begin_stroke().unwrap();
    assert!(ws.wait_for_background(WAIT));

    let tab = ws.active_tab_mut().unwrap();
    tab.add_dirty_rect(PixelRect::new(2, 2, 1, 1)).unwrap();
    tab.document_mut().unwrap().set_pixel(2, 2, [4, 5, 6, 255]);
    assert!(tab.commit_stroke("Pencil").unwrap());
    assert_eq!(tab.document().unwrap().size(), (40, 30));
    assert_eq!(ws.take_batch_report().unwrap().skipped, vec![first]);
}

#[test]
fn untouched_tab_opened_mid_run_gets_undoable_result() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = source_images(&tmp.path().join("src"), 2);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let first = ws.open_file(&paths[0]).unwrap();
    ws.open_file(&paths[1]).unwrap();

    ws.run_batch(BatchOperation::resize(8, 8)).unwrap();
    ws.switch_to_tab(first).unwrap();
    assert!(ws.wait_for_background(WAIT));

    let report = ws.take_batch_report().unwrap();
    assert!(report.is_success());
    let tab = ws.active_tab().unwrap();
    assert_eq!(tab.document().unwrap().size(), (8, 8));
    assert!(tab.is_dirty());

    ws.undo().unwrap();
    let tab = ws.active_tab().unwrap();
    assert_eq!(tab.document().unwrap().size(), (40, 30));
    assert!(!tab.is_dirty());
    assert!(ws.wait_for_background(WAIT));
}
