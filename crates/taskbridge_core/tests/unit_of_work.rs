use taskbridge_core::{
    BridgeConfig, BridgeError, EntityKind, EntityRef, Field, FieldMap, FieldValue, Note, Session,
    SqliteRecordStore, StoreError, Tag, Task, TrackedCounts,
};

fn committed_task(session: &mut Session<SqliteRecordStore>, summary: &str) -> EntityRef {
    let task = session.new_task(Task::new(summary));
    session.add(task).unwrap();
    session.commit().unwrap();
    task
}

fn id_of(session: &Session<SqliteRecordStore>, entity: EntityRef) -> i64 {
    session.entity(entity).unwrap().int_id().unwrap()
}

#[test]
fn add_and_delete_are_idempotent() {
    let mut session = Session::in_memory().unwrap();
    let task = session.new_task(Task::new("twice"));

    session.add(task).unwrap();
    session.add(task).unwrap();
    assert_eq!(session.tracked_counts().added, 1);
    session.commit().unwrap();

    session.delete(task).unwrap();
    session.delete(task).unwrap();
    assert_eq!(session.tracked_counts().deleted, 1);
    session.commit().unwrap();

    assert_eq!(session.tracked_counts(), TrackedCounts::default());
}

#[test]
fn add_and_delete_exclude_each_other() {
    let mut session = Session::in_memory().unwrap();
    let pending = session.new_task(Task::new("pending"));
    session.add(pending).unwrap();
    let error = session.delete(pending).unwrap_err();
    assert!(matches!(error, BridgeError::PendingAddition(entity) if entity == pending));
    session.commit().unwrap();

    session.delete(pending).unwrap();
    let error = session.add(pending).unwrap_err();
    assert!(matches!(error, BridgeError::PendingDeletion(entity) if entity == pending));
    assert!(session.is_pending_delete(pending));
    assert!(!session.is_pending_add(pending));
}

#[test]
fn deleting_an_untracked_entity_fails() {
    let mut session = Session::in_memory().unwrap();
    let loose = session.new_task(Task::new("never added"));

    let error = session.delete(loose).unwrap_err();
    assert!(matches!(error, BridgeError::UntrackedDelete(entity) if entity == loose));
}

#[test]
fn commit_assigns_ids_and_get_by_id_returns_the_same_entity() {
    let mut session = Session::in_memory().unwrap();
    let task = session.new_task(Task::new("persist me"));
    session.set(task, Field::Description, "details").unwrap();
    session.set(task, Field::OrderNum, 4i64).unwrap();
    session.add(task).unwrap();
    assert_eq!(session.entity(task).unwrap().int_id(), None);

    session.commit().unwrap();

    let id = session.entity(task).unwrap().int_id().unwrap();
    assert_eq!(session.get(task, Field::Id).unwrap(), FieldValue::Int(id));
    assert_eq!(session.get_by_id(EntityKind::Task, id).unwrap(), Some(task));
    assert!(!session.is_changed(task));
}

#[test]
fn adding_an_entity_cascades_to_linked_entities() {
    let mut session = Session::in_memory().unwrap();
    let parent = session.new_task(Task::new("parent"));
    let child = session.new_task(Task::new("child"));
    let tag = session.new_tag(Tag::new("cascade"));
    session.insert_child(parent, 0, child).unwrap();
    session.add_to(child, Field::Tags, tag).unwrap();

    session.add(parent).unwrap();
    assert!(session.is_pending_add(child));
    assert!(session.is_pending_add(tag));
    assert_eq!(session.tracked_counts().added, 3);

    session.commit().unwrap();
    let parent_id = session.entity(parent).unwrap().int_id();
    assert!(parent_id.is_some());
    assert_eq!(
        session.get(child, Field::ParentId).unwrap(),
        FieldValue::from(parent_id)
    );
    assert!(session.entity(tag).unwrap().int_id().is_some());
}

#[test]
fn rollback_restores_tracked_entities_to_their_snapshots() {
    let mut session = Session::in_memory().unwrap();
    let task = committed_task(&mut session, "original");
    let tag = session.new_tag(Tag::new("temporary"));

    session.set(task, Field::Summary, "edited").unwrap();
    session.add_to(task, Field::Tags, tag).unwrap();
    assert!(session.is_changed(task));
    assert!(session.is_pending_add(tag));

    session.rollback().unwrap();

    assert_eq!(
        session.get(task, Field::Summary).unwrap(),
        FieldValue::from("original")
    );
    assert!(session.members(task, Field::Tags).unwrap().is_empty());
    assert!(session.members(tag, Field::Tasks).unwrap().is_empty());
    assert_eq!(session.tracked_counts(), TrackedCounts::default());
    assert!(!session.identity_map().contains(tag));
}

#[test]
fn rollback_leaves_untracked_entities_alone() {
    let mut session = Session::in_memory().unwrap();
    let _tracked = committed_task(&mut session, "tracked");
    let loose = session.new_task(Task::new("loose"));

    session.set(loose, Field::Summary, "edited locally").unwrap();
    session.rollback().unwrap();

    assert_eq!(
        session.get(loose, Field::Summary).unwrap(),
        FieldValue::from("edited locally")
    );
    assert!(!session.is_changed(loose));
}

#[test]
fn deleting_a_parent_detaches_children_immediately() {
    let mut session = Session::in_memory().unwrap();
    let parent = session.new_task(Task::new("parent"));
    let child = session.new_task(Task::new("child"));
    session.add(parent).unwrap();
    session.insert_child(parent, 0, child).unwrap();
    session.commit().unwrap();
    let parent_id = session.entity(parent).unwrap().int_id().unwrap();

    session.delete(parent).unwrap();

    assert_eq!(session.get(child, Field::Parent).unwrap(), FieldValue::Null);
    assert_eq!(session.get(child, Field::ParentId).unwrap(), FieldValue::Null);
    assert!(session.is_changed(child));

    session.commit().unwrap();
    assert_eq!(session.get_by_id(EntityKind::Task, parent_id).unwrap(), None);
    assert_eq!(session.get(child, Field::ParentId).unwrap(), FieldValue::Null);
}

#[test]
fn rolling_back_a_delete_restores_its_links() {
    let mut session = Session::in_memory().unwrap();
    let task = session.new_task(Task::new("with note"));
    let note = session.new_note(Note::new("keep me"));
    session.add(task).unwrap();
    session.add_to(task, Field::Notes, note).unwrap();
    session.commit().unwrap();

    session.delete(task).unwrap();
    assert_eq!(session.get(note, Field::Task).unwrap(), FieldValue::Null);

    session.rollback().unwrap();

    assert!(!session.is_pending_delete(task));
    assert_eq!(session.members(task, Field::Notes).unwrap(), vec![note]);
    assert_eq!(session.get(note, Field::Task).unwrap(), FieldValue::Ref(task));
    let id = session.entity(task).unwrap().int_id().unwrap();
    assert_eq!(session.get_by_id(EntityKind::Task, id).unwrap(), Some(task));
}

#[test]
fn duplicate_identity_fails_commit_and_keeps_work_pending() {
    let mut session = Session::in_memory().unwrap();
    let first = session.new_tag(Tag::new("first"));
    let second = session.new_tag(Tag::new("second"));
    session.set(first, Field::Id, 7i64).unwrap();
    session.set(second, Field::Id, 7i64).unwrap();
    session.add(first).unwrap();
    session.add(second).unwrap();

    let error = session.commit().unwrap_err();
    assert!(error.is_constraint_violation(), "unexpected error: {error}");
    assert!(session.is_pending_add(first));
    assert!(session.is_pending_add(second));

    session.rollback().unwrap();
    assert_eq!(session.tracked_counts(), TrackedCounts::default());
    assert!(session.identity_map().is_empty());
    assert_eq!(session.get_by_id(EntityKind::Tag, 7i64).unwrap(), None);
}

#[test]
fn reusing_a_committed_identity_is_rejected_on_add() {
    let mut session = Session::in_memory().unwrap();
    let first = session.new_tag(Tag::new("first"));
    session.set(first, Field::Id, 7i64).unwrap();
    session.add(first).unwrap();
    session.commit().unwrap();

    let second = session.new_tag(Tag::new("second"));
    session.set(second, Field::Id, 7i64).unwrap();
    let error = session.add(second).unwrap_err();
    assert!(matches!(error, BridgeError::IdentityInUse { kind: EntityKind::Tag, .. }));
    assert_eq!(session.get_by_id(EntityKind::Tag, 7i64).unwrap(), Some(first));
}

#[test]
fn update_fields_rejects_collections_before_writing() {
    let mut session = Session::in_memory().unwrap();
    let task = committed_task(&mut session, "partial");

    let mut fields = FieldMap::new();
    fields.insert(Field::Summary, FieldValue::from("changed"));
    fields.insert(Field::Tags, FieldValue::Refs(Vec::new()));
    assert!(session.update_fields(task, &fields).is_err());
    assert!(!session.is_changed(task));

    fields.remove(&Field::Tags);
    fields.insert(Field::IsDone, FieldValue::Bool(true));
    session.update_fields(task, &fields).unwrap();
    session.commit().unwrap();
    assert_eq!(
        session.get(task, Field::IsDone).unwrap(),
        FieldValue::Bool(true)
    );
}

#[test]
fn setting_the_id_of_a_stored_entity_changes_nothing() {
    let mut session = Session::in_memory().unwrap();
    let task = committed_task(&mut session, "stored");
    let id = id_of(&session, task);

    let error = session.set(task, Field::Id, 999i64).unwrap_err();
    assert!(matches!(
        error,
        BridgeError::Store(StoreError::ReadOnlyField {
            field: Field::Id,
            ..
        })
    ));

    assert_eq!(session.get(task, Field::Id).unwrap(), FieldValue::Int(id));
    assert!(!session.is_changed(task));
    assert_eq!(session.tracked_counts(), TrackedCounts::default());
    session.commit().unwrap();
    assert_eq!(session.get_by_id(EntityKind::Task, id).unwrap(), Some(task));
    assert_eq!(session.get_by_id(EntityKind::Task, 999i64).unwrap(), None);
}

#[test]
fn linking_to_a_pending_deletion_changes_nothing() {
    let mut session = Session::in_memory().unwrap();
    let task = committed_task(&mut session, "survivor");
    let doomed = committed_task(&mut session, "doomed");
    let tag = session.new_tag(Tag::new("doomed tag"));
    session.add(tag).unwrap();
    session.commit().unwrap();

    session.delete(tag).unwrap();
    session.delete(doomed).unwrap();
    let pending = session.tracked_counts();

    let error = session.add_to(task, Field::Tags, tag).unwrap_err();
    assert!(matches!(error, BridgeError::PendingDeletion(entity) if entity == tag));
    let error = session.set(task, Field::Parent, doomed).unwrap_err();
    assert!(matches!(error, BridgeError::PendingDeletion(entity) if entity == doomed));
    let error = session.insert_child(doomed, 0, task).unwrap_err();
    assert!(matches!(error, BridgeError::PendingDeletion(entity) if entity == doomed));

    assert!(session.members(task, Field::Tags).unwrap().is_empty());
    assert!(session.members(tag, Field::Tasks).unwrap().is_empty());
    assert!(session.members(doomed, Field::Children).unwrap().is_empty());
    assert_eq!(session.get(task, Field::Parent).unwrap(), FieldValue::Null);
    assert!(!session.is_changed(task));
    assert_eq!(session.tracked_counts(), pending);

    session.commit().unwrap();
    assert_eq!(session.members(task, Field::Tags).unwrap(), Vec::new());
}

#[test]
fn a_failed_cascade_unlinks_the_new_member_again() {
    let mut session = Session::in_memory().unwrap();
    let task = committed_task(&mut session, "tagged");
    let owner = session.new_tag(Tag::new("owner"));
    session.set(owner, Field::Id, 7i64).unwrap();
    session.add(owner).unwrap();
    session.commit().unwrap();

    let impostor = session.new_tag(Tag::new("impostor"));
    session.set(impostor, Field::Id, 7i64).unwrap();
    let error = session.add_to(task, Field::Tags, impostor).unwrap_err();
    assert!(matches!(error, BridgeError::IdentityInUse { kind: EntityKind::Tag, .. }));

    assert!(session.members(task, Field::Tags).unwrap().is_empty());
    assert!(session.members(impostor, Field::Tasks).unwrap().is_empty());
    assert!(!session.is_changed(task));
    assert!(!session.identity_map().contains(impostor));
    assert_eq!(session.tracked_counts(), TrackedCounts::default());

    session.add_to(task, Field::Tags, owner).unwrap();
    session.commit().unwrap();
    assert_eq!(session.members(task, Field::Tags).unwrap(), vec![owner]);
}

#[test]
fn last_parent_assignment_wins_after_commit_in_either_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::with_file(dir.path().join("tasks.db"));

    let (child_id, final_parent_id) = {
        let mut session = Session::open(&config).unwrap();
        let first = session.new_task(Task::new("first parent"));
        let second = session.new_task(Task::new("second parent"));
        let third = session.new_task(Task::new("third parent"));
        let child = session.new_task(Task::new("child"));
        session.add(first).unwrap();
        session.add(second).unwrap();
        session.add(third).unwrap();
        session.insert_child(first, 0, child).unwrap();
        session.commit().unwrap();

        session.insert_child(third, 0, child).unwrap();
        session.set(child, Field::Parent, second).unwrap();
        session.commit().unwrap();

        assert_eq!(session.get(child, Field::Parent).unwrap(), FieldValue::Ref(second));
        assert_eq!(
            session.get(child, Field::ParentId).unwrap(),
            FieldValue::Int(id_of(&session, second))
        );
        assert_eq!(session.members(second, Field::Children).unwrap(), vec![child]);
        assert!(session.members(third, Field::Children).unwrap().is_empty());
        assert!(session.members(first, Field::Children).unwrap().is_empty());

        session.set(child, Field::Parent, third).unwrap();
        session.insert_child(first, 0, child).unwrap();
        session.commit().unwrap();

        assert_eq!(session.get(child, Field::Parent).unwrap(), FieldValue::Ref(first));
        assert_eq!(
            session.get(child, Field::ParentId).unwrap(),
            FieldValue::Int(id_of(&session, first))
        );
        assert_eq!(session.members(first, Field::Children).unwrap(), vec![child]);
        assert!(session.members(second, Field::Children).unwrap().is_empty());
        assert!(session.members(third, Field::Children).unwrap().is_empty());
        (id_of(&session, child), id_of(&session, first))
    };

    let mut session = Session::open(&config).unwrap();
    let child = session.get_by_id(EntityKind::Task, child_id).unwrap().unwrap();
    assert_eq!(
        session.get(child, Field::ParentId).unwrap(),
        FieldValue::Int(final_parent_id)
    );
    let parent = session.get_by_id(EntityKind::Task, final_parent_id).unwrap().unwrap();
    assert_eq!(session.get(child, Field::Parent).unwrap(), FieldValue::Ref(parent));
}

#[test]
fn rolling_back_a_reparent_restores_both_parents() {
    let mut session = Session::in_memory().unwrap();
    let old_parent = session.new_task(Task::new("old parent"));
    let new_parent = session.new_task(Task::new("new parent"));
    let child = session.new_task(Task::new("child"));
    session.add(old_parent).unwrap();
    session.add(new_parent).unwrap();
    session.insert_child(old_parent, 0, child).unwrap();
    session.commit().unwrap();
    let old_id = id_of(&session, old_parent);

    session.set(child, Field::Parent, new_parent).unwrap();
    assert_eq!(session.members(new_parent, Field::Children).unwrap(), vec![child]);

    session.rollback().unwrap();

    assert_eq!(session.get(child, Field::Parent).unwrap(), FieldValue::Ref(old_parent));
    assert_eq!(session.get(child, Field::ParentId).unwrap(), FieldValue::Int(old_id));
    assert_eq!(session.members(old_parent, Field::Children).unwrap(), vec![child]);
    assert!(session.members(new_parent, Field::Children).unwrap().is_empty());
    assert_eq!(session.tracked_counts(), TrackedCounts::default());

    session.commit().unwrap();
    assert_eq!(session.get(child, Field::ParentId).unwrap(), FieldValue::Int(old_id));
}

#[test]
fn rolling_back_a_note_move_returns_it_to_its_task() {
    let mut session = Session::in_memory().unwrap();
    let from = session.new_task(Task::new("from"));
    let to = session.new_task(Task::new("to"));
    let note = session.new_note(Note::new("travelling"));
    session.add(from).unwrap();
    session.add(to).unwrap();
    session.add_to(from, Field::Notes, note).unwrap();
    session.commit().unwrap();

    session.add_to(to, Field::Notes, note).unwrap();
    assert_eq!(session.get(note, Field::Task).unwrap(), FieldValue::Ref(to));
    assert!(session.members(from, Field::Notes).unwrap().is_empty());

    session.rollback().unwrap();

    assert_eq!(session.get(note, Field::Task).unwrap(), FieldValue::Ref(from));
    assert_eq!(session.members(from, Field::Notes).unwrap(), vec![note]);
    assert!(session.members(to, Field::Notes).unwrap().is_empty());
    assert_eq!(
        session.get(note, Field::TaskId).unwrap(),
        FieldValue::Int(id_of(&session, from))
    );
}

#[test]
fn deleting_by_identity_alone_removes_the_stored_entity() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::with_file(dir.path().join("tasks.db"));

    let id = {
        let mut session = Session::open(&config).unwrap();
        let task = committed_task(&mut session, "remove me later");
        id_of(&session, task)
    };

    {
        let mut session = Session::open(&config).unwrap();
        let stand_in = session.new_task(Task::new("stand-in"));
        session.set(stand_in, Field::Id, id).unwrap();
        assert!(!session.is_pending_add(stand_in));

        session.delete(stand_in).unwrap();
        assert!(session.is_pending_delete(stand_in));
        session.commit().unwrap();
        assert_eq!(session.get_by_id(EntityKind::Task, id).unwrap(), None);
    }

    let mut session = Session::open(&config).unwrap();
    assert_eq!(session.get_by_id(EntityKind::Task, id).unwrap(), None);
}
