use snapflow::{Message, to_batches};

#[test]
fn five_items_in_batches_of_two() {
    let files = vec!["f0", "f1", "f2", "f3", "f4"];
    let batches = to_batches(files, 2, None);

    let got: Vec<(usize, Vec<&str>)> = batches.into_iter().map(|b| (b.index, b.items)).collect();
    assert_eq!(got, vec![(0, vec!["f0", "f1"]), (1, vec!["f2", "f3"]), (2, vec!["f4"])]);
}

#[test]
fn every_item_lands_in_exactly_one_batch_in_order() {
    for size in 1..=12 {
        let items: Vec<u32> = (0..37).collect();
        let batches = to_batches(items.clone(), size, None);

        assert!(batches.iter().enumerate().all(|(i, b)| b.index == i));
        assert!(batches.iter().rev().skip(1).all(|b| b.len() == size));
        let flat: Vec<u32> = batches.into_iter().flat_map(|b| b.items).collect();
        assert_eq!(flat, items, "batch size {size}");
    }
}

#[test]
fn batches_become_tasks_with_their_index() {
    let batches = to_batches(vec!['a', 'b', 'c'], 2, None);
    let tasks: Vec<_> = batches.into_iter().map(|b| b.into_task()).collect();

    assert_eq!(tasks[1].batch_index, 1);
    assert_eq!(tasks[1].payload, vec!['c']);
    assert!(matches!(Message::Task(tasks[0].clone()), Message::Task(t) if t.payload == vec!['a', 'b']));
}
