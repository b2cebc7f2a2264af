use std::{
    os::fd::RawFd,
    sync::{Mutex, MutexGuard, PoisonError},
};

use nix::sys::stat::fstat;
use shex::{
    cancel::Cancellation,
    cmd::execution_plan::{InputSource, OutputTarget, Stage},
    process::redirect,
};

// the streams compared here are process-wide
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn identity(fd: RawFd) -> Option<(u64, u64)> {
    fstat(fd).ok().map(|stat| (stat.st_dev as u64, stat.st_ino as u64))
}

fn streams() -> [Option<(u64, u64)>; 3] {
    [0, 1, 2].map(identity)
}

#[test]
fn apply_then_revert_restores_the_same_streams() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    std::fs::write(&input, "data").unwrap();

    let mut stage = Stage::new(["cat"])
        .with_stdin(InputSource::File(input))
        .with_stdout(OutputTarget::Overwrite(dir.path().join("out.txt")))
        .with_stderr(OutputTarget::Null);
    let cancel = Cancellation::new();

    let _serial = serial();
    let before = streams();
    let snapshot = redirect::apply(&mut stage, &cancel, false).unwrap();
    let during = streams();
    assert!(snapshot.is_overridden(0));
    assert!(snapshot.is_overridden(1));
    assert!(snapshot.is_overridden(2));
    snapshot.revert();
    let after = streams();

    assert_ne!(before, during);
    assert_eq!(before, after);
}

#[test]
fn untouched_streams_are_not_overridden() {
    let _serial = serial();
    let mut stage = Stage::new(["true"]);
    let cancel = Cancellation::new();

    let snapshot = redirect::apply(&mut stage, &cancel, false).unwrap();
    assert!(!snapshot.is_overridden(0));
    assert!(!snapshot.is_overridden(1));
    assert!(!snapshot.is_overridden(2));
    assert!(!snapshot.is_aliased());
}

#[test]
fn writes_land_in_the_target_file() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    std::fs::write(&out, "old contents that are longer").unwrap();

    let mut stage = Stage::new(["echo"])
        .with_stdout(OutputTarget::Overwrite(out.clone()))
        .with_stderr(OutputTarget::SameAsOther);
    let cancel = Cancellation::new();

    let snapshot = redirect::apply(&mut stage, &cancel, false).unwrap();
    assert!(snapshot.is_aliased());
    nix::unistd::write(1, b"out ").unwrap();
    nix::unistd::write(2, b"err").unwrap();
    snapshot.revert();

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "out err");

    let mut stage = Stage::new(["echo"]).with_stdout(OutputTarget::Append(out.clone()));
    let snapshot = redirect::apply(&mut stage, &cancel, false).unwrap();
    nix::unistd::write(1, b"\nmore").unwrap();
    drop(snapshot);

    assert_eq!(std::fs::read_to_string(&out).unwrap(), "out err\nmore");
}

#[test]
fn missing_input_file_is_a_redirection_error() {
    let mut stage = Stage::new(["cat"]).with_stdin(InputSource::File("/no/such/file".into()));
    let cancel = Cancellation::new();

    let _serial = serial();
    let before = streams();

    let err = redirect::apply(&mut stage, &cancel, false)
        .err()
        .expect("opening a missing file must fail");
    assert!(err.is_redirection());
    assert!(err.to_string().contains("/no/such/file"));

    assert_eq!(before, streams());
}

#[test]
fn ctrl_c_routing_follows_the_stage_and_is_restored() {
    let _serial = serial();
    let cancel = Cancellation::new();
    let mut builtin = Stage::new(["cd"]);

    let snapshot = redirect::apply(&mut builtin, &cancel, true).unwrap();
    assert!(cancel.is_routed());
    snapshot.revert();
    assert!(!cancel.is_routed());
}
