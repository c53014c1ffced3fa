//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `taskbridge_core` linkage.
//! - Run one add/commit cycle against an in-memory database.
//! - Keep output deterministic for quick local sanity checks.

use std::process::ExitCode;
use taskbridge_core::{
    BridgeResult, EntityKind, Field, Filter, Query, Session, Tag, Task,
};

fn main() -> ExitCode {
    println!("taskbridge_core ping={}", taskbridge_core::ping());
    println!("taskbridge_core version={}", taskbridge_core::core_version());

    match run_probe() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("taskbridge_core probe failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_probe() -> BridgeResult<()> {
    let mut session = Session::in_memory()?;
    let parent = session.new_task(Task::new("plan release"));
    let child = session.new_task(Task::new("write changelog"));
    let tag = session.new_tag(Tag::new("release"));

    session.add(parent)?;
    session.insert_child(parent, 0, child)?;
    session.add_to(child, Field::Tags, tag)?;
    session.commit()?;

    let tagged = session.count(
        EntityKind::Task,
        &Query::new().filter(Filter::HasTag(tag)),
    )?;
    let tasks = session.count(EntityKind::Task, &Query::new())?;
    println!("taskbridge_core probe tasks={tasks} tagged={tagged}");
    Ok(())
}
