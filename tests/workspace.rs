use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use paintfe_core::error::ErrorKind;
use paintfe_core::io::{self, ExportTarget};
use paintfe_core::project::TabLifecycle;
use paintfe_core::{EngineError, EngineSettings, PixelRect, RasterDocument, Workspace};

const WAIT: Duration = Duration::from_secs(30);

fn settings(root: &Path) -> EngineSettings {
    EngineSettings {
        cache_dir: Some(root.join("cache")),
        idle_backup_seconds: 0,
        ..EngineSettings::default()
    }
}

fn write_image(path: &Path, width: u32, height: u32, bgra: [u8; 4]) -> PathBuf {
    io::write_png(&RasterDocument::filled(width, height, bgra), path).unwrap();
    path.to_path_buf()
}

fn paint_active(ws: &mut Workspace, x: u32, y: u32, bgra: [u8; 4]) {
    let tab = ws.active_tab_mut().unwrap();
    tab.begin_stroke().unwrap();
    tab.add_dirty_rect(PixelRect::new(x as i32, y as i32, 1, 1)).unwrap();
    tab.document_mut().unwrap().set_pixel(x, y, bgra);
    assert!(tab.commit_stroke("Pencil").unwrap());
}

#[test]
fn switching_parks_and_backs_up_outgoing_tab() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let a = ws.new_tab(8, 8).unwrap();
    paint_active(&mut ws, 2, 3, [1, 2, 3, 255]);

    let b = ws.new_tab(4, 4).unwrap();
    assert_eq!(ws.active_id(), Some(b));
    let tab_a = ws.tab(a).unwrap();
    assert!(!tab_a.is_resident());
    assert!(tab_a.thumbnail.is_some());

    assert!(ws.wait_for_background(WAIT));
    let tab_a = ws.tab(a).unwrap();
    let backup = ws.cache().backup_path(a);
    assert_eq!(tab_a.backup_path.as_deref(), Some(backup.as_path()));
    assert!(!tab_a.is_parked());
    assert_eq!(io::load_document(&backup).unwrap().pixel(2, 3), Some([1, 2, 3, 255]));

    // Coming back loads the backup and keeps the history usable.
    ws.switch_to_tab(a).unwrap();
    let tab_a = ws.tab(a).unwrap();
    assert_eq!(tab_a.document().unwrap().pixel(2, 3), Some([1, 2, 3, 255]));
    assert!(tab_a.history.can_undo());
    ws.undo().unwrap();
    assert_eq!(ws.active_tab().unwrap().document().unwrap().pixel(2, 3), Some([0, 0, 0, 0]));
}

#[test]
fn quick_switch_back_reclaims_parked_buffer() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let a = ws.new_tab(16, 16).unwrap();
    paint_active(&mut ws, 0, 0, [7, 7, 7, 255]);
    ws.new_tab(16, 16).unwrap();
    // No pump in between: the buffer is still parked.
    ws.switch_to_tab(a).unwrap();
    assert_eq!(ws.active_tab().unwrap().document().unwrap().pixel(0, 0), Some([7, 7, 7, 255]));
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn save_marks_clean_and_drops_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("photo.png"), 6, 6, [0, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    assert_eq!(ws.tab(id).unwrap().lifecycle(), TabLifecycle::Clean);

    paint_active(&mut ws, 1, 1, [200, 100, 50, 255]);
    ws.save_all();
    assert!(ws.wait_for_background(WAIT));
    let backup = ws.tab(id).unwrap().backup_path.clone().unwrap();
    assert!(backup.exists());
    assert_eq!(ws.tab(id).unwrap().display_title(), "photo.png*");

    ws.save_tab(id).unwrap();
    let tab = ws.tab(id).unwrap();
    assert!(!tab.is_dirty());
    assert!(tab.backup_path.is_none());
    assert!(!backup.exists());
    assert_eq!(io::load_document(&file).unwrap().pixel(1, 1), Some([200, 100, 50, 255]));
}

#[test]
fn undo_to_saved_state_is_clean_again() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("a.png"), 4, 4, [0, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    paint_active(&mut ws, 0, 0, [1, 1, 1, 255]);
    assert!(ws.tab(id).unwrap().is_dirty());
    ws.undo().unwrap();
    assert!(!ws.tab(id).unwrap().is_dirty());
    ws.redo().unwrap();
    assert!(ws.tab(id).unwrap().is_dirty());
}

#[test]
fn failed_save_changes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.paste_image(RasterDocument::new(3, 3)).unwrap();

    let err = ws.save_tab_as(id, &blocker.join("out.png")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    let tab = ws.tab(id).unwrap();
    assert!(tab.is_new);
    assert!(tab.is_dirty());
    assert!(tab.file_path.is_none());
    let notes = ws.take_notifications();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].is_error);
}

#[test]
fn save_without_path_needs_save_as() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.new_tab(2, 2).unwrap();
    assert!(matches!(ws.save_tab(id), Err(EngineError::NoPath(t)) if t == id));

    let target = tmp.path().join("saved.png");
    ws.save_tab_as(id, &target).unwrap();
    let tab = ws.tab(id).unwrap();
    assert!(!tab.is_new);
    assert_eq!(tab.name, "saved.png");
    assert_eq!(tab.lifecycle(), TabLifecycle::Clean);
    assert!(target.exists());
}

#[test]
fn closing_dirty_file_tab_retains_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("keep.png"), 5, 5, [0, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    paint_active(&mut ws, 4, 4, [9, 8, 7, 255]);

    ws.close_tab(id).unwrap();
    assert!(ws.tab(id).is_none());
    assert_eq!(ws.active_id(), None);
    assert!(ws.wait_for_background(WAIT));

    let retained: Vec<_> = ws.retained().cloned().collect();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].id, id);
    assert!(retained[0].is_dirty);
    let backup = retained[0].backup_path.clone().unwrap();
    assert_eq!(io::load_document(&backup).unwrap().pixel(4, 4), Some([9, 8, 7, 255]));
    assert_eq!(ws.session_file().retained, retained);
}

#[test]
fn closing_new_tab_discards_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let first = ws.new_tab(4, 4).unwrap();
    ws.new_tab(4, 4).unwrap();
    assert!(ws.wait_for_background(WAIT));
    let backup = ws.cache().backup_path(first);
    assert!(backup.exists());

    ws.close_tab(first).unwrap();
    assert!(ws.wait_for_background(WAIT));
    assert!(!backup.exists());
    assert_eq!(ws.retained().count(), 0);
    assert_eq!(ws.tabs().len(), 1);
}

#[test]
fn navigation_walks_folder_order() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("shots");
    fs::create_dir_all(&dir).unwrap();
    let a = write_image(&dir.join("a.png"), 2, 2, [1, 0, 0, 255]);
    let b = write_image(&dir.join("b.png"), 2, 2, [2, 0, 0, 255]);
    let c = write_image(&dir.join("c.png"), 2, 2, [3, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();

    ws.open_file(&b).unwrap();
    assert_eq!(ws.known_paths(), &[a.clone(), b.clone(), c.clone()]);
    ws.navigate(1).unwrap();
    assert_eq!(ws.active_tab().unwrap().file_path.as_ref(), Some(&c));
    ws.navigate(1).unwrap();
    assert_eq!(ws.active_tab().unwrap().file_path.as_ref(), Some(&a));
    ws.navigate(-1).unwrap();
    assert_eq!(ws.active_tab().unwrap().file_path.as_ref(), Some(&c));
    // Re-opening switches instead of duplicating.
    assert_eq!(ws.tabs().len(), 3);
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn exports_land_in_ephemeral_folders() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    ws.new_tab(3, 3).unwrap();
    let clip = ws.export_active(ExportTarget::Clipboard).unwrap();
    let drag = ws.export_active(ExportTarget::Drag).unwrap();
    assert!(clip.starts_with(ws.cache().export_dir(ExportTarget::Clipboard)));
    assert!(drag.exists());

    ws.purge_ephemeral();
    assert!(!clip.exists());
    assert!(!drag.exists());
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn reset_clears_every_history() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    ws.new_tab(4, 4).unwrap();
    paint_active(&mut ws, 0, 0, [1, 1, 1, 255]);
    ws.new_tab(4, 4).unwrap();
    paint_active(&mut ws, 1, 1, [1, 1, 1, 255]);
    ws.reset();
    assert!(ws.tabs().iter().all(|t| !t.history.can_undo()));
    assert!(matches!(ws.undo(), Err(EngineError::EmptyStack(_))));
    assert!(ws.wait_for_background(WAIT));
}

#[test]
fn backups_coalesce_to_latest_state() {
    let tmp = tempfile::tempdir().unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let a = ws.new_tab(8, 8).unwrap();
    paint_active(&mut ws, 0, 0, [1, 1, 1, 255]);
    let b = ws.new_tab(8, 8).unwrap();

    // First backup of A is still in flight: no events are applied in between.
    ws.switch_to_tab(a).unwrap();
    paint_active(&mut ws, 7, 7, [2, 2, 2, 255]);
    ws.switch_to_tab(b).unwrap();
    assert!(ws.tab(a).unwrap().is_parked());

    assert!(ws.wait_for_background(WAIT));
    let tab_a = ws.tab(a).unwrap();
    assert!(!tab_a.is_parked());
    let backup = ws.cache().backup_path(a);
    assert_eq!(tab_a.backup_path.as_deref(), Some(backup.as_path()));
    let stored = io::load_document(&backup).unwrap();
    assert_eq!(stored.pixel(0, 0), Some([1, 1, 1, 255]));
    assert_eq!(stored.pixel(7, 7), Some([2, 2, 2, 255]));
}

#[test]
fn failed_save_of_unloaded_tab_keeps_history() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("lazy.png"), 4, 4, [0, 0, 0, 255]);
    let blocker = tmp.path().join("not-a-dir");
    fs::write(&blocker, b"x").unwrap();
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    paint_active(&mut ws, 1, 1, [5, 5, 5, 255]);
    ws.new_tab(2, 2).unwrap();
    assert!(ws.wait_for_background(WAIT));

    // Without its backup the tab can only be read from the untouched source.
    let backup = ws.tab(id).unwrap().backup_path.clone().unwrap();
    fs::remove_file(&backup).unwrap();
    assert!(!ws.tab(id).unwrap().is_resident());

    assert!(ws.save_tab_as(id, &blocker.join("out.png")).is_err());
    let tab = ws.tab(id).unwrap();
    assert!(tab.history.can_undo());
    assert!(tab.is_dirty());
    assert_eq!(tab.file_path.as_ref(), Some(&file));
    let notes = ws.take_notifications();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].message.starts_with("Could not save"));
}

#[test]
fn reopening_closed_dirty_file_recovers_pixels() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("again.png"), 5, 5, [0, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    paint_active(&mut ws, 1, 1, [9, 8, 7, 255]);
    ws.close_tab(id).unwrap();

    // Final backup has not been applied yet.
    let reopened = ws.open_file(&file).unwrap();
    assert_eq!(reopened, id);
    assert_eq!(ws.retained().count(), 0);
    let tab = ws.active_tab().unwrap();
    assert!(tab.is_dirty());
    assert_eq!(tab.document().unwrap().pixel(1, 1), Some([9, 8, 7, 255]));

    assert!(ws.wait_for_background(WAIT));
    let backup = ws.tab(id).unwrap().backup_path.clone().unwrap();
    assert_eq!(io::load_document(&backup).unwrap().pixel(1, 1), Some([9, 8, 7, 255]));
    assert!(ws.session_file().retained.is_empty());
}

#[test]
fn discarding_retained_tab_deletes_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_image(&tmp.path().join("drop.png"), 3, 3, [0, 0, 0, 255]);
    let mut ws = Workspace::new(settings(tmp.path())).unwrap();
    let id = ws.open_file(&file).unwrap();
    paint_active(&mut ws, 0, 0, [1, 1, 1, 255]);
    ws.close_tab(id).unwrap();
    assert!(ws.wait_for_background(WAIT));
    let backup = ws.retained().next().unwrap().backup_path.clone().unwrap();
    assert!(backup.exists());

    ws.discard_retained(id).unwrap();
    assert!(!backup.exists());
    assert_eq!(ws.retained().count(), 0);
    assert!(matches!(ws.discard_retained(id), Err(EngineError::UnknownTab(t)) if t == id));

    // The source opens clean once the retained copy is gone.
    ws.open_file(&file).unwrap();
    assert!(!ws.active_tab().unwrap().is_dirty());
    assert!(ws.wait_for_background(WAIT));
}
