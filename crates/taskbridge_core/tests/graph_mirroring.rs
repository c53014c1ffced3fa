use taskbridge_core::{Field, FieldValue, Graph, GraphError, NoopListener, Tag, Task, User};

#[test]
fn conflicting_parent_assignments_keep_the_last_write() {
    let mut graph = Graph::default();
    let first = graph.create_task(Task::new("first"));
    let second = graph.create_task(Task::new("second"));
    let child = graph.create_task(Task::new("child"));

    graph
        .set(child, Field::Parent, FieldValue::Ref(first), &mut NoopListener)
        .unwrap();
    graph
        .add(second, Field::Children, child, &mut NoopListener)
        .unwrap();

    assert_eq!(graph.get(child, Field::Parent).unwrap(), FieldValue::Ref(second));
    assert!(graph.members(first, Field::Children).unwrap().is_empty());
    assert_eq!(graph.members(second, Field::Children).unwrap(), vec![child]);

    graph
        .set(child, Field::Parent, FieldValue::Ref(first), &mut NoopListener)
        .unwrap();

    assert_eq!(graph.get(child, Field::Parent).unwrap(), FieldValue::Ref(first));
    assert_eq!(graph.members(first, Field::Children).unwrap(), vec![child]);
    assert!(graph.members(second, Field::Children).unwrap().is_empty());
}

#[test]
fn clearing_a_parent_removes_the_child_from_its_list() {
    let mut graph = Graph::default();
    let parent = graph.create_task(Task::new("parent"));
    let child = graph.create_task(Task::new("child"));

    graph
        .add(parent, Field::Children, child, &mut NoopListener)
        .unwrap();
    graph
        .set(child, Field::Parent, FieldValue::Null, &mut NoopListener)
        .unwrap();

    assert_eq!(graph.get(child, Field::Parent).unwrap(), FieldValue::Null);
    assert!(graph.members(parent, Field::Children).unwrap().is_empty());
}

#[test]
fn many_to_many_links_are_visible_from_both_sides() {
    let mut graph = Graph::default();
    let task = graph.create_task(Task::new("review"));
    let tag = graph.create_tag(Tag::new("urgent"));
    let user = graph.create_user(User::new("ann@example.com"));

    graph.add(tag, Field::Tasks, task, &mut NoopListener).unwrap();
    graph.add(task, Field::Users, user, &mut NoopListener).unwrap();

    assert_eq!(graph.members(task, Field::Tags).unwrap(), vec![tag]);
    assert_eq!(graph.members(user, Field::Tasks).unwrap(), vec![task]);

    graph
        .discard(task, Field::Tags, tag, &mut NoopListener)
        .unwrap();
    assert!(graph.members(tag, Field::Tasks).unwrap().is_empty());
}

#[test]
fn dependency_and_priority_links_mirror_onto_their_inverse() {
    let mut graph = Graph::default();
    let first = graph.create_task(Task::new("first"));
    let second = graph.create_task(Task::new("second"));

    graph
        .add(second, Field::Dependees, first, &mut NoopListener)
        .unwrap();
    graph
        .add(first, Field::PrioritizeBefore, second, &mut NoopListener)
        .unwrap();

    assert_eq!(graph.members(first, Field::Dependants).unwrap(), vec![second]);
    assert_eq!(graph.members(second, Field::PrioritizeAfter).unwrap(), vec![first]);
}

#[test]
fn insert_child_moves_existing_children_with_index_adjustment() {
    let mut graph = Graph::default();
    let parent = graph.create_task(Task::new("parent"));
    let a = graph.create_task(Task::new("a"));
    let b = graph.create_task(Task::new("b"));
    let c = graph.create_task(Task::new("c"));
    for child in [a, b, c] {
        graph
            .add(parent, Field::Children, child, &mut NoopListener)
            .unwrap();
    }

    graph.insert_child(parent, 3, a, &mut NoopListener).unwrap();
    assert_eq!(graph.members(parent, Field::Children).unwrap(), vec![b, c, a]);

    graph.insert_child(parent, 0, c, &mut NoopListener).unwrap();
    assert_eq!(graph.members(parent, Field::Children).unwrap(), vec![c, b, a]);
    assert_eq!(graph.child_at(parent, 1).unwrap(), b);
}

#[test]
fn insert_child_rehomes_a_child_of_another_parent() {
    let mut graph = Graph::default();
    let old_parent = graph.create_task(Task::new("old"));
    let new_parent = graph.create_task(Task::new("new"));
    let sibling = graph.create_task(Task::new("sibling"));
    let child = graph.create_task(Task::new("child"));

    graph
        .add(old_parent, Field::Children, child, &mut NoopListener)
        .unwrap();
    graph
        .add(new_parent, Field::Children, sibling, &mut NoopListener)
        .unwrap();
    graph
        .insert_child(new_parent, 0, child, &mut NoopListener)
        .unwrap();

    assert!(graph.members(old_parent, Field::Children).unwrap().is_empty());
    assert_eq!(
        graph.members(new_parent, Field::Children).unwrap(),
        vec![child, sibling]
    );
    assert_eq!(
        graph.get(child, Field::Parent).unwrap(),
        FieldValue::Ref(new_parent)
    );
}

#[test]
fn restore_puts_back_relationships_without_notifying() {
    let mut graph = Graph::default();
    let task = graph.create_task(Task::new("snap"));
    let tag = graph.create_tag(Tag::new("kept"));
    graph.add(task, Field::Tags, tag, &mut NoopListener).unwrap();
    let snapshot = graph.entity(task).unwrap().clone();

    graph
        .discard(task, Field::Tags, tag, &mut NoopListener)
        .unwrap();
    graph
        .set(task, Field::Summary, FieldValue::from("edited"), &mut NoopListener)
        .unwrap();
    graph.restore(task, &snapshot).unwrap();

    assert_eq!(graph.task(task).unwrap().summary(), "snap");
    assert_eq!(graph.members(tag, Field::Tasks).unwrap(), vec![task]);
}

#[test]
fn adding_a_member_of_the_wrong_kind_is_rejected() {
    let mut graph = Graph::default();
    let task = graph.create_task(Task::new("typed"));
    let other = graph.create_task(Task::new("not a tag"));

    let error = graph
        .add(task, Field::Tags, other, &mut NoopListener)
        .unwrap_err();
    assert!(matches!(error, GraphError::KindMismatch { .. }));
}
