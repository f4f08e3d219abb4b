//! # Fixture Schemas
//!
//! Statically initialised schemas used by tests across the workspace and by
//! embedders that want a worked example of a table-backed trait.

/// A thermostat trait with a struct, a dictionary of structs and an
/// optional, nullable, ephemeral leaf.
///
/// ```text
/// #0  root
/// #1  current_temperature  Float
/// #2  target_temperature   Float   nullable
/// #3  mode                 UInt
/// #4  settings             struct  optional
/// #5    eco                Bool
/// #6    label              Text
/// #7  schedules            dictionary
/// #8    start              UInt
/// #9    setpoint           Float
/// #10 last_error           Text    optional nullable ephemeral
/// ```
pub mod thermostat {
    use crate::domain::{PropertyInfo, SchemaTables, TraitSchema};
    use shared_types::{ProfileId, PropertyHandle, SchemaVersion, TypeTag};

    /// Profile id of the thermostat trait.
    pub const PROFILE: ProfileId = ProfileId(0x0000_0E01);

    /// Handle of `current_temperature`.
    pub const CURRENT_TEMPERATURE: PropertyHandle = PropertyHandle(1);
    /// Handle of `target_temperature`.
    pub const TARGET_TEMPERATURE: PropertyHandle = PropertyHandle(2);
    /// Handle of `mode`.
    pub const MODE: PropertyHandle = PropertyHandle(3);
    /// Handle of `settings`.
    pub const SETTINGS: PropertyHandle = PropertyHandle(4);
    /// Handle of `eco`.
    pub const ECO: PropertyHandle = PropertyHandle(5);
    /// Handle of `label`.
    pub const LABEL: PropertyHandle = PropertyHandle(6);
    /// Handle of `schedules`.
    pub const SCHEDULES: PropertyHandle = PropertyHandle(7);
    /// Handle of `start`.
    pub const START: PropertyHandle = PropertyHandle(8);
    /// Handle of `setpoint`.
    pub const SETPOINT: PropertyHandle = PropertyHandle(9);
    /// Handle of `last_error`.
    pub const LAST_ERROR: PropertyHandle = PropertyHandle(10);

    static PROPERTIES: [PropertyInfo; 11] = [
        PropertyInfo::ROOT,
        PropertyInfo::new(0, 1),
        PropertyInfo::new(0, 2),
        PropertyInfo::new(0, 3),
        PropertyInfo::new(0, 4),
        PropertyInfo::new(4, 1),
        PropertyInfo::new(4, 2),
        PropertyInfo::new(0, 5),
        PropertyInfo::new(7, 1),
        PropertyInfo::new(7, 2),
        PropertyInfo::new(0, 6),
    ];

    static LEAF_TYPES: [Option<TypeTag>; 11] = [
        None,
        Some(TypeTag::Float),
        Some(TypeTag::Float),
        Some(TypeTag::UInt),
        None,
        Some(TypeTag::Bool),
        Some(TypeTag::Text),
        None,
        Some(TypeTag::UInt),
        Some(TypeTag::Float),
        Some(TypeTag::Text),
    ];

    static OPTIONAL: [u64; 1] = [(1 << 4) | (1 << 10)];
    static NULLABLE: [u64; 1] = [(1 << 2) | (1 << 10)];
    static DICTIONARY: [u64; 1] = [1 << 7];
    static EPHEMERAL: [u64; 1] = [1 << 10];

    /// The thermostat schema, versions 1 through 2.
    pub static SCHEMA: TraitSchema = TraitSchema::from_tables(
        PROFILE,
        SchemaTables {
            properties: &PROPERTIES,
            leaf_types: &LEAF_TYPES,
            optional: &OPTIONAL,
            nullable: &NULLABLE,
            dictionary: &DICTIONARY,
            ephemeral: &EPHEMERAL,
            min_version: SchemaVersion(1),
            max_version: SchemaVersion(2),
        },
    );

    /// Cheap owned copy of [`SCHEMA`]; the tables stay borrowed.
    pub fn schema() -> TraitSchema {
        SCHEMA.clone()
    }

    /// The same trait declared with only version 1 support.
    pub fn schema_v1_only() -> TraitSchema {
        TraitSchema::from_tables(
            PROFILE,
            SchemaTables {
                properties: &PROPERTIES,
                leaf_types: &LEAF_TYPES,
                optional: &OPTIONAL,
                nullable: &NULLABLE,
                dictionary: &DICTIONARY,
                ephemeral: &EPHEMERAL,
                min_version: SchemaVersion(1),
                max_version: SchemaVersion(1),
            },
        )
    }
}
