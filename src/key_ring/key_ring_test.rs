use super::*;
use crate::error::Result;

fn material(seed: u8) -> KeyMaterial {
    KeyMaterial::new(&[seed; 32]).unwrap()
}

#[test]
fn test_set_and_get() -> Result<()> {
    let mut ring = KeyRing::new(16);
    assert!(ring.get(0).is_none());
    assert!(ring.current().is_none());

    ring.set(material(1), 0)?;
    assert!(ring.get(0).is_some());
    let (index, _) = ring.current().unwrap();
    assert_eq!(index, 0);

    // Last write wins at the same index.
    ring.set(material(2), 0)?;
    let entry = ring.get(0).unwrap();
    assert_eq!(entry.material.expose(), material(2).expose());
    Ok(())
}

#[test]
fn test_cursor_advances_forward_only() -> Result<()> {
    let mut ring = KeyRing::new(16);
    ring.set(material(1), 5)?;
    assert_eq!(ring.current().unwrap().0, 5);

    // One ahead: advances.
    ring.set(material(2), 6)?;
    assert_eq!(ring.current().unwrap().0, 6);

    // More than half the ring ahead reads as an old announcement arriving
    // late; the cursor stays.
    ring.set(material(3), 15)?;
    assert_eq!(ring.current().unwrap().0, 6);

    // Exactly half the ring ahead still advances.
    ring.set(material(4), 14)?;
    assert_eq!(ring.current().unwrap().0, 14);
    Ok(())
}

#[test]
fn test_rollover_evicts_oldest() -> Result<()> {
    let mut ring = KeyRing::new(16);
    for index in 0..=16u8 {
        ring.set(material(index), index)?;
    }

    // Index 16 landed in slot 0, evicting index 0.
    assert!(ring.get(0).is_none());
    assert!(ring.get(16).is_some());
    for index in 1..=15u8 {
        assert!(ring.get(index).is_some());
    }
    assert_eq!(ring.current().unwrap().0, 16);
    Ok(())
}

#[test]
fn test_clear() -> Result<()> {
    let mut ring = KeyRing::new(16);
    ring.set(material(1), 0)?;
    ring.set(material(2), 1)?;

    ring.clear(0);
    assert!(ring.get(0).is_none());
    assert!(ring.get(1).is_some());

    // Clearing an index that no longer occupies its slot is a no-op.
    ring.set(material(3), 17)?;
    ring.clear(1);
    assert!(ring.get(17).is_some());

    ring.clear_all();
    assert!(ring.get(17).is_none());
    assert!(ring.current().is_none());
    Ok(())
}

#[test]
fn test_replace_material_keeps_cursor() -> Result<()> {
    let mut ring = KeyRing::new(16);
    ring.set(material(1), 2)?;
    ring.set(material(2), 3)?;

    ring.replace_material(2, material(9))?;
    assert_eq!(ring.get(2).unwrap().material.expose(), material(9).expose());
    assert_eq!(ring.current().unwrap().0, 3);
    Ok(())
}

#[test]
fn test_single_slot_ring_follows_last_write() -> Result<()> {
    let mut ring = KeyRing::new(1);
    ring.set(material(1), 0)?;
    ring.set(material(2), 1)?;
    assert!(ring.get(0).is_none());
    assert_eq!(ring.current().unwrap().0, 1);
    Ok(())
}
