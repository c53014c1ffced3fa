use serde_json::json;
use taskbridge_core::{Entity, EntityKind, Field, Query, Session, Tag, Task};

#[test]
fn entity_snapshot_survives_json() {
    let mut session = Session::in_memory().unwrap();
    let parent = session.new_task(Task::new("parent"));
    let child = session.new_task(Task::new("child"));
    let tag = session.new_tag(Tag::new("json"));
    session.add(parent).unwrap();
    session.insert_child(parent, 0, child).unwrap();
    session.add_to(child, Field::Tags, tag).unwrap();
    session.commit().unwrap();

    let snapshot = session.entity(child).unwrap().clone();
    let encoded = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(encoded["kind"], json!("task"));
    assert_eq!(encoded["summary"], json!("child"));
    assert_eq!(encoded["parent"]["state"], json!("resolved"));

    let decoded: Entity = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, snapshot);
    assert_eq!(decoded.kind(), EntityKind::Task);
}

#[test]
fn field_map_uses_field_names() {
    let mut session = Session::in_memory().unwrap();
    let task = session.new_task(Task::new("mapped"));
    session.add(task).unwrap();
    session.commit().unwrap();

    let fields = session.field_map(task).unwrap();
    let encoded = serde_json::to_value(&fields).unwrap();

    assert_eq!(
        encoded["summary"],
        json!({ "type": "text", "value": "mapped" })
    );
    assert_eq!(encoded["is_done"], json!({ "type": "bool", "value": false }));
    assert_eq!(encoded["parent"], json!({ "type": "null" }));
    assert!(encoded["children"]["value"].as_array().unwrap().is_empty());
}

#[test]
fn paged_results_serialize_with_totals() {
    let mut session = Session::in_memory().unwrap();
    for summary in ["one", "two", "three"] {
        let task = session.new_task(Task::new(summary));
        session.add(task).unwrap();
    }
    session.commit().unwrap();

    let page = session
        .paginate(EntityKind::Task, &Query::new(), 1, 2)
        .unwrap();
    let encoded = serde_json::to_value(&page).unwrap();

    assert_eq!(encoded["total"], json!(3));
    assert_eq!(encoded["num_pages"], json!(2));
    assert_eq!(encoded["items"].as_array().unwrap().len(), 2);
}
