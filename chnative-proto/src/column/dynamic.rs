use super::column_type::ColumnType;
use super::value::Value;
use super::{ColumnError, Columnar, NULL_DISCRIMINANT};
use crate::frame::{PacketReader, PacketWriter};

const STRUCTURE_VERSION: u64 = 1;
const VARIANT_BASIC_MODE: u64 = 0;
const DEFAULT_MAX_TYPES: usize = 32;
/// Name the server gives the overflow alternative holding binary-encoded values.
const SHARED_VARIANT: &str = "SharedVariant";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Typed(usize),
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DynRow {
    Null,
    Typed { ty: usize, offset: usize },
    Shared(usize),
}

/// `Dynamic`: a Variant whose set of types is announced in the column prefix.
///
/// Types are learned from the stream or from pushed values. Rows the server stored
/// in its shared variant are exposed as raw [`Value::Bytes`].
#[derive(Debug, Clone, Default)]
pub struct DynamicColumn {
    types: Vec<ColumnType>,
    columns: Vec<Columnar>,
    shared: Vec<Vec<u8>>,
    rows: Vec<DynRow>,
    // discriminant -> storage, as announced by the last prefix read
    slots: Vec<Slot>,
}

impl PartialEq for DynamicColumn {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
            && self.columns == other.columns
            && self.shared == other.shared
            && self.rows == other.rows
    }
}

impl DynamicColumn {
    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.shared.clear();
        self.columns.iter_mut().for_each(Columnar::clear);
    }

    pub fn value(&self, row: usize) -> Value {
        match self.rows[row] {
            DynRow::Null => Value::Null,
            DynRow::Typed { ty, offset } => self.columns[ty].value(offset),
            DynRow::Shared(i) => Value::Bytes(self.shared[i].clone()),
        }
    }

    fn type_index(&mut self, ty: ColumnType) -> Result<usize, ColumnError> {
        if let Some(i) = self.types.iter().position(|t| *t == ty) {
            return Ok(i);
        }
        // Every type plus the shared variant needs its own discriminant.
        if self.types.len() + 1 >= NULL_DISCRIMINANT as usize {
            return Err(ColumnError::BadType {
                type_name: "Dynamic".to_owned(),
                reason: "too many distinct types",
            });
        }
        self.columns.push(Columnar::new(&ty));
        self.types.push(ty);
        Ok(self.types.len() - 1)
    }

    fn push_typed(&mut self, ty: usize, value: Value) -> Result<(), ColumnError> {
        let column = &mut self.columns[ty];
        let offset = column.len();
        column.push(value)?;
        self.rows.push(DynRow::Typed { ty, offset });
        Ok(())
    }

    fn push_shared(&mut self, raw: Vec<u8>) {
        self.rows.push(DynRow::Shared(self.shared.len()));
        self.shared.push(raw);
    }

    /// Appends a value, learning its natural type if it is new to the column.
    /// Raw bytes go to the shared variant.
    pub fn push(&mut self, value: Value) -> Result<(), ColumnError> {
        match value {
            Value::Null => self.rows.push(DynRow::Null),
            Value::Bytes(raw) => self.push_shared(raw),
            value => {
                let ty = ColumnType::of_value(&value)
                    .ok_or_else(|| ColumnError::mismatch(&ColumnType::Dynamic, &value))?;
                let ty = self.type_index(ty)?;
                self.push_typed(ty, value)?;
            }
        }
        Ok(())
    }

    pub fn push_default(&mut self) {
        self.rows.push(DynRow::Null)
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        let mut out = DynamicColumn {
            types: self.types.clone(),
            columns: self.types.iter().map(Columnar::new).collect(),
            ..Default::default()
        };
        for row in &self.rows[lo..hi] {
            match *row {
                DynRow::Null => out.rows.push(DynRow::Null),
                DynRow::Typed { ty, offset } => {
                    let value = self.columns[ty].value(offset);
                    // Same type on both sides, so the value always fits.
                    let _ = out.push_typed(ty, value);
                }
                DynRow::Shared(i) => out.push_shared(self.shared[i].clone()),
            }
        }
        out
    }

    /// Storage slots in discriminant order: all alternatives sorted by name.
    fn wire_order(&self) -> Vec<(String, Slot)> {
        let mut order: Vec<(String, Slot)> = self
            .types
            .iter()
            .enumerate()
            .map(|(i, ty)| (ty.to_string(), Slot::Typed(i)))
            .collect();
        order.push((SHARED_VARIANT.to_owned(), Slot::Shared));
        order.sort_by(|a, b| a.0.cmp(&b.0));
        order
    }

    pub async fn read_prefix(&mut self, r: &mut PacketReader) -> Result<(), ColumnError> {
        let version = r.read_u64().await?;
        if version != STRUCTURE_VERSION {
            return Err(ColumnError::BadVersion {
                what: "Dynamic structure",
                version,
            });
        }
        let _max_types = r.read_uvarint().await?;
        let count = r.read_uvarint().await?;

        let mut announced = Vec::new();
        for _ in 0..count {
            let name = r.read_string().await?;
            let ty = ColumnType::parse(&name)?;
            announced.push((name, Slot::Typed(self.type_index(ty)?)));
        }
        announced.push((SHARED_VARIANT.to_owned(), Slot::Shared));
        announced.sort_by(|a, b| a.0.cmp(&b.0));
        self.slots = announced.into_iter().map(|(_, slot)| slot).collect();

        let mode = r.read_u64().await?;
        if mode != VARIANT_BASIC_MODE {
            return Err(ColumnError::BadVersion {
                what: "Variant discriminators",
                version: mode,
            });
        }
        for slot in &self.slots {
            if let Slot::Typed(i) = *slot {
                self.columns[i].read_prefix(r).await?;
            }
        }
        Ok(())
    }

    pub async fn read_data(&mut self, r: &mut PacketReader, rows: usize) -> Result<(), ColumnError> {
        let discriminators = r.read_fixed(rows, 1).await?;

        let mut counts = vec![0usize; self.slots.len()];
        let mut new_rows = Vec::with_capacity(rows);
        for &d in &discriminators {
            if d == NULL_DISCRIMINANT {
                new_rows.push(DynRow::Null);
                continue;
            }
            let slot = *self
                .slots
                .get(d as usize)
                .ok_or(ColumnError::UnknownDiscriminant(d))?;
            let seen = counts[d as usize];
            new_rows.push(match slot {
                Slot::Typed(ty) => DynRow::Typed {
                    ty,
                    offset: self.columns[ty].len() + seen,
                },
                Slot::Shared => DynRow::Shared(self.shared.len() + seen),
            });
            counts[d as usize] += 1;
        }

        for (slot, count) in self.slots.clone().into_iter().zip(counts) {
            if count == 0 {
                continue;
            }
            match slot {
                Slot::Typed(ty) => self.columns[ty].read_data(r, count).await?,
                Slot::Shared => {
                    for _ in 0..count {
                        let raw = r.read_bytes().await?;
                        self.shared.push(raw);
                    }
                }
            }
        }
        self.rows.extend(new_rows);
        Ok(())
    }

    pub fn write_prefix(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let order = self.wire_order();
        w.write_u64(STRUCTURE_VERSION)?;
        w.write_uvarint(self.types.len().max(DEFAULT_MAX_TYPES) as u64)?;
        w.write_uvarint(self.types.len() as u64)?;
        for (name, slot) in &order {
            if let Slot::Typed(_) = slot {
                w.write_string(name)?;
            }
        }
        w.write_u64(VARIANT_BASIC_MODE)?;
        for (_, slot) in &order {
            if let Slot::Typed(i) = *slot {
                self.columns[i].write_prefix(w)?;
            }
        }
        Ok(())
    }

    pub fn write_data(&self, w: &mut PacketWriter) -> Result<(), ColumnError> {
        let order = self.wire_order();
        let mut typed_discriminant = vec![0u8; self.types.len()];
        let mut shared_discriminant = 0u8;
        for (d, (_, slot)) in order.iter().enumerate() {
            match *slot {
                Slot::Typed(i) => typed_discriminant[i] = d as u8,
                Slot::Shared => shared_discriminant = d as u8,
            }
        }

        let discriminators: Vec<u8> = self
            .rows
            .iter()
            .map(|row| match *row {
                DynRow::Null => NULL_DISCRIMINANT,
                DynRow::Typed { ty, .. } => typed_discriminant[ty],
                DynRow::Shared(_) => shared_discriminant,
            })
            .collect();
        w.write_raw(&discriminators)?;

        for (_, slot) in &order {
            match *slot {
                Slot::Typed(i) if !self.columns[i].is_empty() => self.columns[i].write_data(w)?,
                Slot::Typed(_) => {}
                Slot::Shared => {
                    for raw in &self.shared {
                        w.write_bytes(raw)?;
                    }
                }
            }
        }
        Ok(())
    }
}
