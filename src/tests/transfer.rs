use super::{int16_cells, ndvi, setup, setup_with, test_config, TestItems};
use crate::error::ShimError;
use crate::model::{ArrayMetadata, Attribute, Dimension, Rectangle, ScalarType, NULL_INDICATOR_PRESENT};
use crate::transfer::ScratchStrategy;
use crate::transport::Endpoint;

const UNTOUCHED: u8 = 0x55;

fn at(buf: &[u8], cols: usize, row: usize, col: usize) -> i16 {
    let i = (row * cols + col) * 2;
    i16::from_le_bytes([buf[i], buf[i + 1]])
}

#[test]
fn test_round_trip() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();

    let rect = Rectangle::new(100, 109, 200, 204);
    let written = int16_cells((0..50).map(|v| v * 3 - 70));
    client.write(&meta, rect, &written).unwrap();

    let mut read = vec![0u8; written.len()];
    client.read(&meta, 0, rect, &mut read).unwrap();
    assert_eq!(written, read);

    let state = state.borrow();
    let queries = state.queries();
    assert!(queries.contains(&"project(between(ndvi,100,200,109,204),band1)".to_string()));
    assert_eq!(Some(&int16_cells(vec![-67])), state.cell("ndvi", 100, 201));
    assert_eq!(Some(&int16_cells(vec![-70 + 3 * 5])), state.cell("ndvi", 101, 200));
}

#[test]
fn test_boundary_read_leaves_tail_untouched() {
    let TestItems { mut client, state } = setup();
    {
        let mut state = state.borrow_mut();
        state.add_array(ndvi());
        state.put_cell("ndvi", 768, 0, int16_cells(vec![3]));
        state.put_cell("ndvi", 900, 100, int16_cells(vec![-2]));
        state.put_cell("ndvi", 999, 511, int16_cells(vec![7]));
    }
    let meta = client.describe("ndvi").unwrap();

    // 256 x 512 block whose last 24 rows lie past x=999.
    let rect = Rectangle::new(768, 1023, 0, 511);
    let mut buf = vec![UNTOUCHED; 256 * 512 * 2];
    client.read(&meta, 0, rect, &mut buf).unwrap();

    assert_eq!(3, at(&buf, 512, 0, 0));
    assert_eq!(0, at(&buf, 512, 0, 1));
    assert_eq!(-2, at(&buf, 512, 132, 100));
    assert_eq!(7, at(&buf, 512, 231, 511));
    assert!(buf[232 * 512 * 2..].iter().all(|b| *b == UNTOUCHED));

    let queries = state.borrow().queries();
    assert_eq!(
        Some(&"project(between(ndvi,768,0,999,511),band1)".to_string()),
        queries.last()
    );
}

#[test]
fn test_boundary_read_clips_both_axes() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    state.borrow_mut().put_cell("ndvi", 0, 998, int16_cells(vec![11]));
    let meta = client.describe("ndvi").unwrap();

    let rect = Rectangle::new(-2, 1, 997, 1000);
    let mut buf = vec![UNTOUCHED; 4 * 4 * 2];
    client.read(&meta, 0, rect, &mut buf).unwrap();

    for row in 0..4 {
        for col in 0..4 {
            let i = (row * 4 + col) * 2;
            let in_range = row >= 2 && col <= 2;
            assert_eq!(in_range, buf[i] != UNTOUCHED, "row {} col {}", row, col);
        }
    }
    assert_eq!(11, at(&buf, 4, 2, 1));
}

#[test]
fn test_boundary_write_drops_out_of_range_cells() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();

    // 20 x 10 block, only 10 x 5 of it inside the array.
    let rect = Rectangle::new(990, 1009, 995, 1004);
    let buf = int16_cells(0..200);
    client.write(&meta, rect, &buf).unwrap();

    let state = state.borrow();
    assert_eq!(50, state.arrays["ndvi"].cells.len());
    assert_eq!(Some(&int16_cells(vec![0])), state.cell("ndvi", 990, 995));
    assert_eq!(Some(&int16_cells(vec![94])), state.cell("ndvi", 999, 999));
    assert_eq!(Some(&int16_cells(vec![12])), state.cell("ndvi", 991, 997));
    let upload = state.calls.iter().find(|c| c.endpoint == Endpoint::UploadFile).unwrap();
    assert_eq!(Some(100), upload.payload.as_ref().map(|p| p.len()));
    assert!(client.scratch_capacity() >= 100);
}

#[test]
fn test_fresh_scratch_strategy() {
    let config = crate::config::ClientConfig {
        scratch: ScratchStrategy::Fresh,
        ..test_config(true)
    };
    let TestItems { mut client, state } = setup_with(config);
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();

    client
        .write(&meta, Rectangle::new(998, 1001, 0, 3), &int16_cells(0..16))
        .unwrap();
    assert_eq!(16, client.scratch_capacity());
    client
        .write(&meta, Rectangle::new(999, 1000, 0, 1), &int16_cells(0..4))
        .unwrap();
    assert_eq!(4, client.scratch_capacity());
}

#[test]
fn test_disjoint_rectangle_is_transfer_error() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();
    let before = state.borrow().queries().len();

    let rect = Rectangle::new(1000, 1010, 0, 10);
    let mut buf = vec![0u8; 11 * 11 * 2];
    match client.read(&meta, 0, rect, &mut buf) {
        Err(ShimError::Transfer { array, rect: failed, .. }) => {
            assert_eq!("ndvi", array);
            assert_eq!(rect, failed);
        }
        other => panic!("expected Transfer error, got {:?}", other),
    }
    assert!(matches!(
        client.write(&meta, rect, &buf),
        Err(ShimError::Transfer { .. })
    ));
    assert_eq!(before, state.borrow().queries().len());
}

#[test]
fn test_short_buffer_is_transfer_error() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();

    let mut buf = vec![0u8; 3];
    assert!(matches!(
        client.read(&meta, 0, Rectangle::new(0, 1, 0, 0), &mut buf),
        Err(ShimError::Transfer { .. })
    ));
}

#[test]
fn test_oversized_rectangle_is_transfer_error() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();
    let before = state.borrow().queries().len();

    let rect = Rectangle::new(0, 1 << 40, 0, 1 << 40);
    let mut buf = [0u8; 16];
    match client.read(&meta, 0, rect, &mut buf) {
        Err(ShimError::Transfer { rect: failed, reason, .. }) => {
            assert_eq!(rect, failed);
            assert!(reason.contains("addressable"), "{}", reason);
        }
        other => panic!("expected Transfer error, got {:?}", other),
    }
    assert!(matches!(
        client.write(&meta, rect, &buf),
        Err(ShimError::Transfer { .. })
    ));
    assert_eq!(before, state.borrow().queries().len());
    assert!(state.borrow().live.is_empty());
}

#[test]
fn test_inverted_rectangle_is_query_build_error() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();

    let mut buf = vec![0u8; 16];
    assert!(matches!(
        client.read(&meta, 0, Rectangle::new(5, 4, 0, 0), &mut buf),
        Err(ShimError::QueryBuild(_))
    ));
}

#[test]
fn test_transport_failure_carries_rectangle() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();
    state
        .borrow_mut()
        .failing_queries
        .push("project(between(".to_string());

    let rect = Rectangle::new(0, 3, 0, 3);
    let mut buf = vec![0u8; 32];
    match client.read(&meta, 0, rect, &mut buf) {
        Err(ShimError::Transfer { array, rect: failed, reason }) => {
            assert_eq!("ndvi", array);
            assert_eq!(rect, failed);
            assert!(reason.contains("3 attempt"), "{}", reason);
        }
        other => panic!("expected Transfer error, got {:?}", other),
    }
    assert!(state.borrow().live.is_empty());
}

fn assert_write_failure_carries_rectangle(state_setup: impl FnOnce(&mut super::FakeState)) {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();
    state_setup(&mut state.borrow_mut());

    let rect = Rectangle::new(10, 13, 20, 23);
    match client.write(&meta, rect, &int16_cells(0..16)) {
        Err(ShimError::Transfer { array, rect: failed, reason }) => {
            assert_eq!("ndvi", array);
            assert_eq!(rect, failed);
            assert!(reason.contains("3 attempt"), "{}", reason);
        }
        other => panic!("expected Transfer error, got {:?}", other),
    }
    let state = state.borrow();
    assert!(state.live.is_empty());
    assert!(state.arrays["ndvi"].cells.is_empty());
}

#[test]
fn test_upload_failure_carries_rectangle() {
    assert_write_failure_carries_rectangle(|state| {
        state.faults.insert(Endpoint::UploadFile, 3);
    });
}

#[test]
fn test_insert_failure_carries_rectangle() {
    assert_write_failure_carries_rectangle(|state| {
        state.failing_queries.push("insert(".to_string());
    });
}

#[test]
fn test_payload_length_mismatch() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ndvi());
    let meta = client.describe("ndvi").unwrap();
    state.borrow_mut().short_reads = true;

    let mut buf = vec![0u8; 32];
    match client.read(&meta, 0, Rectangle::new(0, 3, 0, 3), &mut buf) {
        Err(ShimError::Transfer { reason, .. }) => assert!(reason.contains("31 bytes"), "{}", reason),
        other => panic!("expected Transfer error, got {:?}", other),
    }
}

#[test]
fn test_nullable_attribute_round_trip() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ArrayMetadata::new(
        "mixed",
        vec![
            Attribute::new("a", ScalarType::Int8, false),
            Attribute::new("b", ScalarType::Float64, true),
        ],
        vec![Dimension::new("x", 0, 9, 10), Dimension::new("y", 0, 9, 10)],
    ));
    let meta = client.describe("mixed").unwrap();
    assert_eq!(10, meta.cell_width());

    let mut records = Vec::new();
    for i in 0..4u8 {
        records.push(i);
        if i == 2 {
            records.push(0);
            records.extend_from_slice(&[0; 8]);
        } else {
            records.push(NULL_INDICATOR_PRESENT);
            records.extend_from_slice(&(i as f64 * 0.5).to_le_bytes());
        }
    }
    let rect = Rectangle::new(0, 1, 0, 1);
    client.write(&meta, rect, &records).unwrap();

    let mut a = vec![0u8; 4];
    client.read(&meta, 0, rect, &mut a).unwrap();
    assert_eq!(vec![0, 1, 2, 3], a);

    let mut b = vec![0u8; 4 * 9];
    client.read(&meta, 1, rect, &mut b).unwrap();
    assert_eq!(NULL_INDICATOR_PRESENT, b[9]);
    assert_eq!(0.5, f64::from_le_bytes([b[10], b[11], b[12], b[13], b[14], b[15], b[16], b[17]]));
    assert_eq!(0, b[18]);

    let insert = state.borrow().queries().into_iter().find(|q| q.starts_with("insert(")).unwrap();
    assert!(insert.contains("'(int8,float64 NULL)'"), "{}", insert);
}

#[test]
fn test_swapped_native_axes() {
    let TestItems { mut client, state } = setup();
    state.borrow_mut().add_array(ArrayMetadata::new(
        "tall",
        vec![Attribute::new("v", ScalarType::Int16, false)],
        vec![Dimension::new("y", 0, 99, 10), Dimension::new("x", 0, 49, 10)],
    ));
    let meta = client.describe("tall").unwrap();

    // Buffer rows follow native dimension 0 (y): 2 rows of 3 columns.
    let rect = Rectangle::new(10, 12, 20, 21);
    client.write(&meta, rect, &int16_cells(0..6)).unwrap();
    assert_eq!(Some(&int16_cells(vec![5])), state.borrow().cell("tall", 21, 12));
    assert_eq!(Some(&int16_cells(vec![1])), state.borrow().cell("tall", 20, 11));

    let mut buf = vec![0u8; 12];
    client.read(&meta, 0, rect, &mut buf).unwrap();
    assert_eq!(int16_cells(0..6), buf);
    assert!(state
        .borrow()
        .queries()
        .contains(&"project(between(tall,20,10,21,12),v)".to_string()));
}
