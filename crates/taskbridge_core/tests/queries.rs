use taskbridge_core::{
    AppOption, BridgeConfig, BridgeError, EntityKind, EntityRef, Field, FieldValue, Filter,
    LazyRef, Note, Query, Session, SortDirection, SortField, SqliteRecordStore, Tag, Task,
};

fn seeded() -> (Session<SqliteRecordStore>, Vec<EntityRef>) {
    let mut session = Session::in_memory().unwrap();
    let summaries = [
        "alpha release notes",
        "Alpha release plan",
        "beta",
        "gamma",
        "delta",
    ];
    let mut tasks = Vec::new();
    for (index, summary) in summaries.into_iter().enumerate() {
        let task = session.new_task(Task::new(summary));
        session.set(task, Field::OrderNum, index as i64 + 1).unwrap();
        session.add(task).unwrap();
        tasks.push(task);
    }
    session.set(tasks[2], Field::IsDone, true).unwrap();
    session.commit().unwrap();
    (session, tasks)
}

#[test]
fn find_applies_filters_and_ordering() {
    let (mut session, tasks) = seeded();

    let open = session
        .find(
            EntityKind::Task,
            &Query::new()
                .filter(Filter::IsDone(false))
                .order_by(SortField::OrderNum, SortDirection::Desc),
        )
        .unwrap();

    assert_eq!(open, vec![tasks[4], tasks[3], tasks[1], tasks[0]]);
    assert_eq!(
        session
            .count(EntityKind::Task, &Query::new().filter(Filter::IsDone(true)))
            .unwrap(),
        1
    );
}

#[test]
fn search_normalizes_whitespace_and_ignores_case() {
    let (mut session, tasks) = seeded();

    let found = session
        .find(
            EntityKind::Task,
            &Query::new().filter(Filter::Search("  ALPHA   release ".to_string())),
        )
        .unwrap();
    assert_eq!(found, vec![tasks[0], tasks[1]]);

    let blank = session
        .count(
            EntityKind::Task,
            &Query::new().filter(Filter::Search("   ".to_string())),
        )
        .unwrap();
    assert_eq!(blank, 5);
}

#[test]
fn paginate_reports_totals_and_normalizes_page_size() {
    let (mut session, tasks) = seeded();
    let ordered = Query::new().order_by(SortField::OrderNum, SortDirection::Asc);

    let page = session.paginate(EntityKind::Task, &ordered, 2, 2).unwrap();
    assert_eq!(page.items, vec![tasks[2], tasks[3]]);
    assert_eq!(page.total, 5);
    assert_eq!(page.page, 2);
    assert_eq!(page.per_page, 2);
    assert_eq!(page.num_pages, 3);

    let defaulted = session.paginate(EntityKind::Task, &ordered, 0, 0).unwrap();
    assert_eq!(defaulted.page, 1);
    assert_eq!(defaulted.per_page, 20);
    assert_eq!(defaulted.num_pages, 1);
    assert_eq!(defaulted.items.len(), 5);

    let past_the_end = session.paginate(EntityKind::Task, &ordered, 9, 2).unwrap();
    assert!(past_the_end.items.is_empty());
    assert_eq!(past_the_end.total, 5);
}

#[test]
fn repeated_queries_return_the_same_entities() {
    let (mut session, _) = seeded();

    let first = session.find(EntityKind::Task, &Query::new()).unwrap();
    let second = session.find(EntityKind::Task, &Query::new()).unwrap();

    assert_eq!(first, second);
    assert_eq!(session.identity_map().len(), 5);
}

#[test]
fn queries_see_pending_work() {
    let (mut session, tasks) = seeded();
    let tag = session.new_tag(Tag::new("review"));
    session.add_to(tasks[3], Field::Tags, tag).unwrap();

    let tagged = session
        .find(EntityKind::Task, &Query::new().filter(Filter::HasTag(tag)))
        .unwrap();
    assert_eq!(tagged, vec![tasks[3]]);

    let tags = session
        .find(EntityKind::Tag, &Query::new().filter(Filter::HasTask(tasks[3])))
        .unwrap();
    assert_eq!(tags, vec![tag]);
}

#[test]
fn filters_on_unknown_entities_match_nothing() {
    let (mut session, _) = seeded();
    let loose = session.new_tag(Tag::new("never stored"));
    let query = Query::new().filter(Filter::HasTag(loose));

    assert!(session.find(EntityKind::Task, &query).unwrap().is_empty());
    assert_eq!(session.count(EntityKind::Task, &query).unwrap(), 0);
    assert_eq!(session.paginate(EntityKind::Task, &query, 1, 10).unwrap().total, 0);
}

#[test]
fn get_by_id_checks_the_identity_shape() {
    let (mut session, _) = seeded();

    let error = session.get_by_id(EntityKind::Task, "abc").unwrap_err();
    assert!(matches!(error, BridgeError::InvalidIdentity { kind: EntityKind::Task, .. }));

    let error = session.get_by_id(EntityKind::AppOption, 3i64).unwrap_err();
    assert!(matches!(error, BridgeError::InvalidIdentity { .. }));

    assert_eq!(session.get_by_id(EntityKind::Task, 999i64).unwrap(), None);
}

#[test]
fn options_are_keyed_by_text() {
    let mut session = Session::in_memory().unwrap();
    let theme = session.new_option(AppOption::new("theme", Some("dark".to_string())));
    session.add(theme).unwrap();
    session.commit().unwrap();

    assert_eq!(session.get_by_id(EntityKind::AppOption, "theme").unwrap(), Some(theme));
    assert_eq!(session.get_by_id(EntityKind::AppOption, "font").unwrap(), None);
    assert_eq!(
        session.get(theme, Field::Value).unwrap(),
        FieldValue::from("dark")
    );

    let keyed = session
        .find(
            EntityKind::AppOption,
            &Query::new().filter(Filter::KeyIn(vec!["theme".into(), "font".into()])),
        )
        .unwrap();
    assert_eq!(keyed, vec![theme]);
}

#[test]
fn references_load_lazily_in_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::with_file(dir.path().join("tasks.db"));

    let (parent_id, child_id) = {
        let mut session = Session::open(&config).unwrap();
        let parent = session.new_task(Task::new("parent"));
        let child = session.new_task(Task::new("child"));
        let note = session.new_note(Note::new("on the child"));
        session.add(parent).unwrap();
        session.insert_child(parent, 0, child).unwrap();
        session.add_to(child, Field::Notes, note).unwrap();
        session.commit().unwrap();
        (
            session.entity(parent).unwrap().int_id().unwrap(),
            session.entity(child).unwrap().int_id().unwrap(),
        )
    };

    let mut session = Session::open(&config).unwrap();
    let child = session.get_by_id(EntityKind::Task, child_id).unwrap().unwrap();
    assert!(matches!(
        session.graph().lazy_ref(child, Field::Parent).unwrap(),
        LazyRef::Unresolved(_)
    ));
    assert_eq!(
        session.get(child, Field::ParentId).unwrap(),
        FieldValue::Int(parent_id)
    );

    let parent = session.resolve(child, Field::Parent).unwrap().unwrap();
    assert_eq!(session.get_by_id(EntityKind::Task, parent_id).unwrap(), Some(parent));
    assert_eq!(session.members(parent, Field::Children).unwrap(), vec![child]);

    let notes = session.members(child, Field::Notes).unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(session.get(notes[0], Field::Task).unwrap(), FieldValue::Ref(child));
    assert_eq!(
        session
            .count(EntityKind::Note, &Query::new().filter(Filter::TaskIs(Some(child))))
            .unwrap(),
        1
    );
}
