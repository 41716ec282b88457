pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Untrained images: uploads waiting for a training run, plus images submitted for prediction
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    filepath TEXT NOT NULL,
    origin TEXT NOT NULL DEFAULT 'upload',  -- 'upload' or 'prediction'
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_images_origin ON images(origin);

CREATE TABLE IF NOT EXISTS labels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label);
CREATE INDEX IF NOT EXISTS idx_labels_image ON labels(image_id);

-- One row per successful training run; history only, never updated
CREATE TABLE IF NOT EXISTS models (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    filepath TEXT NOT NULL,
    trained_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    artifact_sha256 TEXT,
    num_classes INTEGER NOT NULL DEFAULT 0,
    num_images INTEGER NOT NULL DEFAULT 0,
    validation_accuracy REAL
);

-- Untrained images consumed by a run. No foreign key on image_id: a scoped
-- run moves the image row away right after linking it.
CREATE TABLE IF NOT EXISTS model_images (
    model_id INTEGER NOT NULL,
    image_id INTEGER NOT NULL,
    PRIMARY KEY (model_id, image_id),
    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE CASCADE
);

-- Images already consumed by a completed label-scoped run
CREATE TABLE IF NOT EXISTS trained_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL,
    filepath TEXT NOT NULL,
    model_id INTEGER,
    trained_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (model_id) REFERENCES models(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS trained_labels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trained_image_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    FOREIGN KEY (trained_image_id) REFERENCES trained_images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_trained_labels_label ON trained_labels(label);
"#;

