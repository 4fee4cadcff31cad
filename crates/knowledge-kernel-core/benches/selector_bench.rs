use criterion::{criterion_group, criterion_main, Criterion};
use knowledge_kernel_core::{
    select_flat_rules, select_knowledge_items, Department, FlatRule, ItemId, ItemType,
    KnowledgeItem, KnowledgeTree, NodeId, Priority, Scope, SelectionContext, SubDepartment,
    Workflow,
};
use time::{Duration, OffsetDateTime};

fn bench_as_of() -> OffsetDateTime {
    // Later than every item's effective date so the full pipeline runs.
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

fn mk_item(index: usize) -> KnowledgeItem {
    let priority = match index % 3 {
        0 => Priority::High,
        1 => Priority::Medium,
        _ => Priority::Low,
    };

    KnowledgeItem {
        item_id: ItemId::new(),
        title: format!("Bench rule {index}"),
        item_type: ItemType::Rule,
        ai_instructions: Some(format!(
            "Verify documentation set {index} before releasing payment"
        )),
        command_body: None,
        content: None,
        scope: Scope::default(),
        tags: vec![format!("tag-{}", index % 10)],
        priority,
        order: i64::try_from(index % 50).unwrap_or_default(),
        version: 1,
        effective: "2020-01-01".to_string(),
        sunset: None,
        is_active: true,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
        updated_by: "bench".to_string(),
        change_note: None,
    }
}

fn mk_tree(items_per_workflow: usize) -> KnowledgeTree {
    let departments = (0..5)
        .map(|dept_index| Department {
            node_id: NodeId::new(),
            name: format!("Department {dept_index}"),
            order: 1,
            sub_departments: (0..4)
                .map(|sub_index| SubDepartment {
                    node_id: NodeId::new(),
                    name: format!("Sub {sub_index}"),
                    order: 1,
                    workflows: (0..5)
                        .map(|wf_index| Workflow {
                            node_id: NodeId::new(),
                            name: format!("Workflow {wf_index}"),
                            order: 1,
                            items: (0..items_per_workflow).map(mk_item).collect(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    KnowledgeTree { version: 1, last_modified: OffsetDateTime::UNIX_EPOCH, departments }
}

fn mk_context() -> SelectionContext {
    SelectionContext {
        user_id: "bench_user".to_string(),
        user_role: "PA".to_string(),
        user_department: "Department 2".to_string(),
        user_state: Some("FL".to_string()),
        claim_severity: Some(3),
        intent: Some("tag-4".to_string()),
        workflow_context: None,
        as_of: bench_as_of(),
    }
}

fn bench_tree_selection(c: &mut Criterion) {
    // 5 depts x 4 subs x 5 workflows x 10 items = 1000 items.
    let tree = mk_tree(10);
    let context = mk_context();

    c.bench_function("tree_selection_1000_items", |b| {
        b.iter(|| {
            let result = select_knowledge_items(&tree, &context);
            if result.audit.candidate_ids.is_empty() {
                panic!("tree benchmark selection produced no candidates");
            }
        });
    });
}

fn bench_flat_selection(c: &mut Criterion) {
    let rules = (0..1_000)
        .map(|index| FlatRule {
            department_path: vec![
                format!("Department {}", index % 5),
                format!("Sub {}", index % 4),
            ],
            item: mk_item(index),
        })
        .collect::<Vec<_>>();
    let context = mk_context();

    c.bench_function("flat_selection_1000_rules", |b| {
        b.iter(|| {
            let result = select_flat_rules(&rules, &context);
            if result.audit.candidate_ids.is_empty() {
                panic!("flat benchmark selection produced no candidates");
            }
        });
    });
}

criterion_group!(selector_benches, bench_tree_selection, bench_flat_selection);
criterion_main!(selector_benches);
