//! Loading of TOML configuration structs from a main directory, with optional per-setup overlays.
//!
//! A config lives at `<main>/<PATH>`. An overlay file at `<overlay>/<PATH>` only needs to contain
//! the keys it changes; it is merged over the main table before deserialization.

mod error;


use std::{fs, path::Path};

use serde::{Serialize, de::DeserializeOwned};
use toml::Table;

pub use error::{ConfigKind, Error, ErrorKind, Result};

/// A configuration struct backed by a TOML file.
pub trait Config: Sized + Serialize + DeserializeOwned {
    /// File name of the config, relative to a config root.
    const PATH: &'static str;

    /// Load the config from `<root>/<PATH>`.
    fn load(root: impl AsRef<Path>) -> Result<Self> {
        let table = read_table::<Self>(root.as_ref(), ConfigKind::Main)?;
        table_into::<Self>(table)
    }

    /// Load the config from `<main>/<PATH>`, with `<overlay>/<PATH>` merged on top.
    fn load_with_overlay(main: impl AsRef<Path>, overlay: impl AsRef<Path>) -> Result<Self> {
        let main = read_table::<Self>(main.as_ref(), ConfigKind::Main)?;
        let overlay = read_table::<Self>(overlay.as_ref(), ConfigKind::Overlay)?;

        table_into::<Self>(generate_config(main, overlay, true))
    }

    /// Write the full config to `<root>/<PATH>`.
    fn store(&self, root: impl AsRef<Path>) -> Result<()> {
        let table = to_table(self)?;
        write_table::<Self>(root.as_ref(), &table)
    }

    /// Write only the values that differ from `main` to `<overlay>/<PATH>`.
    fn save_as_overlay(&self, main: &Self, overlay: impl AsRef<Path>) -> Result<()> {
        let diff = extract_diff(&to_table(main)?, &to_table(self)?);
        write_table::<Self>(overlay.as_ref(), &diff)
    }
}

/// Merge `overlay` over `main`, recursing into sub-tables.
///
/// Keys that only exist in `overlay` are kept when `add_key` is set.
#[must_use]
pub fn generate_config(main: Table, overlay: Table, add_key: bool) -> Table {
    let mut generated = Table::new();

    for (k, v) in &main {
        match (v, overlay.get(k)) {
            (toml::Value::Table(main_table), Some(toml::Value::Table(overlay_table))) => {
                let merged = generate_config(main_table.clone(), overlay_table.clone(), add_key);
                generated.insert(k.clone(), toml::Value::Table(merged));
            }
            (_, Some(overlay_value)) => {
                generated.insert(k.clone(), overlay_value.clone());
            }
            (_, None) => {
                generated.insert(k.clone(), v.clone());
            }
        }
    }

    if add_key {
        for (k, v) in overlay {
            if !main.contains_key(&k) {
                generated.insert(k, v);
            }
        }
    }

    generated
}

/// Collect the entries of `changed` that differ from `main`.
///
/// Sub-tables are compared recursively and only included when something inside them changed.
#[must_use]
pub fn extract_diff(main: &Table, changed: &Table) -> Table {
    let mut diff = Table::new();

    for (k, v) in changed {
        match (main.get(k), v) {
            (Some(toml::Value::Table(main_table)), toml::Value::Table(changed_table)) => {
                let nested = extract_diff(main_table, changed_table);
                if !nested.is_empty() {
                    diff.insert(k.clone(), toml::Value::Table(nested));
                }
            }
            (Some(main_value), changed_value) if main_value == changed_value => {}
            _ => {
                diff.insert(k.clone(), v.clone());
            }
        }
    }

    diff
}

fn read_table<T: Config>(root: &Path, config_kind: ConfigKind) -> Result<Table> {
    let path = root.join(T::PATH);
    let display = path.display().to_string();

    let contents = fs::read_to_string(&path).map_err(|source| Error {
        name: std::any::type_name::<T>(),
        kind: ErrorKind::Load {
            path: display.clone(),
            config_kind,
            source,
        },
    })?;

    contents.parse::<Table>().map_err(|source| Error {
        name: std::any::type_name::<T>(),
        kind: ErrorKind::Parse {
            path: display,
            config_kind,
            source,
        },
    })
}

fn table_into<T: Config>(table: Table) -> Result<T> {
    toml::Value::Table(table).try_into().map_err(|source| Error {
        name: std::any::type_name::<T>(),
        kind: ErrorKind::Merge(source),
    })
}

fn to_table<T: Config>(config: &T) -> Result<Table> {
    match toml::Value::try_from(config) {
        Ok(toml::Value::Table(table)) => Ok(table),
        Ok(_) => Err(Error {
            name: std::any::type_name::<T>(),
            kind: ErrorKind::Serialize(<toml::ser::Error as serde::ser::Error>::custom(
                "config must serialize to a table",
            )),
        }),
        Err(source) => Err(Error {
            name: std::any::type_name::<T>(),
            kind: ErrorKind::Serialize(source),
        }),
    }
}

fn write_table<T: Config>(root: &Path, table: &Table) -> Result<()> {
    let path = root.join(T::PATH);
    let contents = toml::to_string_pretty(table).map_err(|source| Error {
        name: std::any::type_name::<T>(),
        kind: ErrorKind::Serialize(source),
    })?;

    fs::write(&path, contents).map_err(|source| Error {
        name: std::any::type_name::<T>(),
        kind: ErrorKind::Store {
            path: path.display().to_string(),
            source,
        },
    })
}
