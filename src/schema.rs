//! The team roster schema
//!
//! Players, matches, per-match statistics and attendance, with goalkeepers as a subtype of
//! players. [`DDL`] creates the matching PostgreSQL tables; [`shapes`] holds response types.

use crate::model::{ColumnDef, ColumnType, ModelDef, RelationDef, RelationKind};

pub static PLAYER: ModelDef = ModelDef {
    name: "Player",
    table: "players",
    primary_key: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Uuid),
        ColumnDef::new("name", ColumnType::Text),
        ColumnDef::new("last_name", ColumnType::Text).nullable(),
        ColumnDef::new("email", ColumnType::Text),
        ColumnDef::new("shirt_number", ColumnType::Integer).nullable(),
        ColumnDef::new("position", ColumnType::Text).nullable(),
        ColumnDef::new("birth_date", ColumnType::Date).nullable(),
        ColumnDef::new("active", ColumnType::Boolean),
        ColumnDef::new("goals", ColumnType::Integer),
        ColumnDef::new("medical_check_date", ColumnType::Date).nullable(),
        ColumnDef::new("tags", ColumnType::TextArray).nullable(),
        ColumnDef::new("updates_metadata", ColumnType::Json).nullable(),
        ColumnDef::new("created_at", ColumnType::TimestampTz),
        ColumnDef::new("updated_at", ColumnType::TimestampTz).nullable(),
        ColumnDef::new("full_name", ColumnType::Text).computed(),
    ],
    relations: &[
        RelationDef {
            name: "statistics",
            target: statistic,
            kind: RelationKind::HasMany {
                foreign_key: "player_id",
            },
        },
        RelationDef {
            name: "attendances",
            target: attendance,
            kind: RelationKind::HasMany {
                foreign_key: "player_id",
            },
        },
        RelationDef {
            name: "matches",
            target: match_model,
            kind: RelationKind::ManyToMany {
                through: "match_squads",
                source_key: "player_id",
                target_key: "match_id",
            },
        },
    ],
    subtypes: &[goalkeeper],
    tracking_column: Some("updates_metadata"),
};

pub static GOALKEEPER: ModelDef = ModelDef {
    name: "Goalkeeper",
    table: "goalkeepers",
    primary_key: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Uuid),
        ColumnDef::new("clean_sheets", ColumnType::Integer),
        ColumnDef::new("gloves_size", ColumnType::Text).nullable(),
    ],
    relations: &[],
    subtypes: &[],
    tracking_column: None,
};

pub static MATCH: ModelDef = ModelDef {
    name: "Match",
    table: "matches",
    primary_key: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Uuid),
        ColumnDef::new("played_on", ColumnType::Date),
        ColumnDef::new("opponent", ColumnType::Text),
        ColumnDef::new("home_score", ColumnType::Integer).nullable(),
        ColumnDef::new("away_score", ColumnType::Integer).nullable(),
        ColumnDef::new("venue", ColumnType::Text).nullable(),
        ColumnDef::new("kind", ColumnType::Text),
        ColumnDef::new("notes", ColumnType::Text).nullable(),
    ],
    relations: &[
        RelationDef {
            name: "statistics",
            target: statistic,
            kind: RelationKind::HasMany {
                foreign_key: "match_id",
            },
        },
        RelationDef {
            name: "attendances",
            target: attendance,
            kind: RelationKind::HasMany {
                foreign_key: "match_id",
            },
        },
        RelationDef {
            name: "players",
            target: player,
            kind: RelationKind::ManyToMany {
                through: "match_squads",
                source_key: "match_id",
                target_key: "player_id",
            },
        },
    ],
    subtypes: &[],
    tracking_column: None,
};

pub static STATISTIC: ModelDef = ModelDef {
    name: "Statistic",
    table: "statistics",
    primary_key: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Uuid),
        ColumnDef::new("player_id", ColumnType::Uuid),
        ColumnDef::new("match_id", ColumnType::Uuid),
        ColumnDef::new("goals", ColumnType::Integer),
        ColumnDef::new("assists", ColumnType::Integer),
        ColumnDef::new("yellow_cards", ColumnType::SmallInt),
        ColumnDef::new("red_cards", ColumnType::SmallInt),
        ColumnDef::new("minutes_played", ColumnType::Integer),
        ColumnDef::new("starter", ColumnType::Boolean),
    ],
    relations: &[
        RelationDef {
            name: "player",
            target: player,
            kind: RelationKind::BelongsTo {
                foreign_key: "player_id",
            },
        },
        RelationDef {
            name: "match",
            target: match_model,
            kind: RelationKind::BelongsTo {
                foreign_key: "match_id",
            },
        },
    ],
    subtypes: &[],
    tracking_column: None,
};

pub static ATTENDANCE: ModelDef = ModelDef {
    name: "Attendance",
    table: "attendances",
    primary_key: "id",
    columns: &[
        ColumnDef::new("id", ColumnType::Uuid),
        ColumnDef::new("player_id", ColumnType::Uuid),
        ColumnDef::new("match_id", ColumnType::Uuid),
        ColumnDef::new("present", ColumnType::Boolean),
        ColumnDef::new("excuse", ColumnType::Text).nullable(),
    ],
    relations: &[
        RelationDef {
            name: "player",
            target: player,
            kind: RelationKind::BelongsTo {
                foreign_key: "player_id",
            },
        },
        RelationDef {
            name: "match",
            target: match_model,
            kind: RelationKind::BelongsTo {
                foreign_key: "match_id",
            },
        },
    ],
    subtypes: &[],
    tracking_column: None,
};

pub fn player() -> &'static ModelDef {
    &PLAYER
}

pub fn goalkeeper() -> &'static ModelDef {
    &GOALKEEPER
}

pub fn match_model() -> &'static ModelDef {
    &MATCH
}

pub fn statistic() -> &'static ModelDef {
    &STATISTIC
}

pub fn attendance() -> &'static ModelDef {
    &ATTENDANCE
}

pub fn models() -> [&'static ModelDef; 5] {
    [player(), goalkeeper(), match_model(), statistic(), attendance()]
}

/// Tables for the roster schema
pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS players (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    name text NOT NULL,
    last_name text,
    email text NOT NULL CONSTRAINT players_email_key UNIQUE,
    shirt_number integer CONSTRAINT players_shirt_number_key UNIQUE,
    position text,
    birth_date date,
    active boolean NOT NULL DEFAULT true,
    goals integer NOT NULL DEFAULT 0,
    medical_check_date date,
    tags text[],
    updates_metadata jsonb,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz
);

CREATE TABLE IF NOT EXISTS goalkeepers (
    id uuid PRIMARY KEY REFERENCES players (id) ON DELETE CASCADE,
    clean_sheets integer NOT NULL DEFAULT 0,
    gloves_size text
);

CREATE TABLE IF NOT EXISTS matches (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    played_on date NOT NULL,
    opponent text NOT NULL,
    home_score integer,
    away_score integer,
    venue text,
    kind text NOT NULL DEFAULT 'league',
    notes text
);

CREATE TABLE IF NOT EXISTS match_squads (
    player_id uuid NOT NULL REFERENCES players (id) ON DELETE CASCADE,
    match_id uuid NOT NULL REFERENCES matches (id) ON DELETE CASCADE,
    PRIMARY KEY (player_id, match_id)
);

CREATE TABLE IF NOT EXISTS statistics (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    player_id uuid NOT NULL REFERENCES players (id) ON DELETE RESTRICT,
    match_id uuid NOT NULL REFERENCES matches (id) ON DELETE RESTRICT,
    goals integer NOT NULL DEFAULT 0,
    assists integer NOT NULL DEFAULT 0,
    yellow_cards smallint NOT NULL DEFAULT 0,
    red_cards smallint NOT NULL DEFAULT 0,
    minutes_played integer NOT NULL DEFAULT 0,
    starter boolean NOT NULL DEFAULT false,
    CONSTRAINT statistics_player_match_key UNIQUE (player_id, match_id)
);

CREATE TABLE IF NOT EXISTS attendances (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    player_id uuid NOT NULL REFERENCES players (id) ON DELETE RESTRICT,
    match_id uuid NOT NULL REFERENCES matches (id) ON DELETE RESTRICT,
    present boolean NOT NULL DEFAULT true,
    excuse text
);
"#;

/// Drops everything [`DDL`] creates
pub const DROP_DDL: &str =
    "DROP TABLE IF EXISTS attendances, statistics, match_squads, goalkeepers, matches, players CASCADE";

/// Response types
pub mod shapes {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use crate::OutputShape;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct MatchSummary {
        pub id: Uuid,
        pub opponent: String,
        pub played_on: NaiveDate,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct PlayerSummary {
        pub id: Uuid,
        pub name: String,
        pub shirt_number: Option<i32>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct PlayerWithMatches {
        pub id: Uuid,
        pub name: String,
        pub email: String,
        pub matches: Vec<MatchSummary>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct PlayerDetail {
        pub id: Uuid,
        pub name: String,
        pub last_name: Option<String>,
        pub email: String,
        pub shirt_number: Option<i32>,
        pub position: Option<String>,
        pub active: bool,
        pub goals: i32,
        pub tags: Option<Vec<String>>,
        pub created_at: DateTime<Utc>,
        #[shape(lazy)]
        #[serde(default)]
        pub updates_metadata: Option<serde_json::Value>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct StatisticLine {
        pub id: Uuid,
        pub goals: i32,
        pub assists: i32,
        pub player: Option<PlayerSummary>,
        #[serde(rename = "match")]
        #[shape(rename = "match")]
        pub fixture: Option<MatchSummary>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, OutputShape)]
    pub struct MatchReport {
        pub id: Uuid,
        pub opponent: String,
        pub home_score: Option<i32>,
        pub away_score: Option<i32>,
        pub statistics: Vec<StatisticLine>,
    }
}
