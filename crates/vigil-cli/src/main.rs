use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use vigil_core::{Embedding, FaceIndex, EMBEDDING_DIM};

#[derive(Parser)]
#[command(name = "vigil", about = "vigil attendance system admin CLI")]
struct Cli {
    /// Data directory of the daemon (contains vigil.db and index/)
    #[arg(long, default_value = "./vigil-data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show index and database statistics
    Stats,
    /// Check that the index and the database agree on enrolled embeddings
    Verify,
    /// Rebuild the index artifacts from the embeddings stored in the
    /// database. Run this with the daemon stopped.
    Rebuild,
}

struct Paths {
    db: PathBuf,
    vectors: PathBuf,
    slots: PathBuf,
}

impl Paths {
    fn new(data_dir: &Path) -> Self {
        Self {
            db: data_dir.join("vigil.db"),
            vectors: data_dir.join("index").join("vectors.bin"),
            slots: data_dir.join("index").join("slots.json"),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new(&cli.data_dir);

    match cli.command {
        Commands::Stats => stats(&paths),
        Commands::Verify => verify(&paths),
        Commands::Rebuild => rebuild(&paths),
    }
}

fn open_db(paths: &Paths) -> Result<Connection> {
    if !paths.db.exists() {
        bail!("database not found at {}", paths.db.display());
    }
    Connection::open(&paths.db).with_context(|| format!("open {}", paths.db.display()))
}

fn load_index(paths: &Paths) -> Result<FaceIndex> {
    FaceIndex::load(EMBEDDING_DIM, &paths.vectors, &paths.slots)
        .with_context(|| format!("load index from {}", paths.vectors.display()))
}

/// `(student_id, embedding)` for every stored reference image.
fn stored_embeddings(conn: &Connection) -> Result<Vec<(i64, Embedding)>> {
    let mut stmt = conn.prepare("SELECT student_id, embedding FROM student_images ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (student_id, blob) = row?;
        let values: Vec<f32> = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        out.push((student_id, Embedding::from_values(values)));
    }
    Ok(out)
}

fn stats(paths: &Paths) -> Result<()> {
    let conn = open_db(paths)?;
    let index = load_index(paths)?;

    let students: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?;
    let images: i64 = conn.query_row("SELECT COUNT(*) FROM student_images", [], |r| r.get(0))?;
    let attendance: i64 = conn.query_row("SELECT COUNT(*) FROM attendance", [], |r| r.get(0))?;
    let rooms: i64 = conn.query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))?;
    let cameras: i64 = conn.query_row("SELECT COUNT(*) FROM cameras", [], |r| r.get(0))?;

    println!("database ({})", paths.db.display());
    println!("  students:    {students}");
    println!("  ref images:  {images}");
    println!("  attendance:  {attendance}");
    println!("  rooms:       {rooms} ({cameras} cameras)");
    println!("index ({})", paths.vectors.display());
    println!("  vectors:     {}", index.size());
    println!("  persons:     {}", index.person_count());
    println!("  dimension:   {}", index.dimension());
    Ok(())
}

fn verify(paths: &Paths) -> Result<()> {
    let conn = open_db(paths)?;
    let index = load_index(paths)?;
    let stored = stored_embeddings(&conn)?;

    let mut db_counts: HashMap<i64, usize> = HashMap::new();
    for (student_id, _) in &stored {
        *db_counts.entry(*student_id).or_default() += 1;
    }

    let mut mismatches = 0usize;
    for (&student_id, &db_count) in &db_counts {
        let index_count = index.slots_for_person(student_id);
        if index_count != db_count {
            mismatches += 1;
            println!("student {student_id}: {db_count} rows in DB, {index_count} index slots");
        }
    }
    if index.size() != stored.len() {
        println!(
            "totals differ: {} DB rows, {} index slots",
            stored.len(),
            index.size()
        );
        mismatches += 1;
    }

    if mismatches == 0 {
        println!(
            "OK: {} embeddings for {} students, index agrees",
            stored.len(),
            db_counts.len()
        );
        Ok(())
    } else {
        eprintln!("{mismatches} mismatch(es) found — run `vigil rebuild` to reconcile");
        std::process::exit(1);
    }
}

fn rebuild(paths: &Paths) -> Result<()> {
    let conn = open_db(paths)?;
    let stored = stored_embeddings(&conn)?;

    let mut index = FaceIndex::new(EMBEDDING_DIM);
    let mut skipped = 0usize;
    for (student_id, embedding) in &stored {
        match index.add(*student_id, embedding) {
            Ok(_) => {}
            Err(err) => {
                eprintln!("skipping one embedding for student {student_id}: {err}");
                skipped += 1;
            }
        }
    }

    index
        .persist(&paths.vectors, &paths.slots)
        .context("persist rebuilt index")?;
    println!(
        "rebuilt index: {} vectors for {} persons ({} skipped)",
        index.size(),
        index.person_count(),
        skipped
    );
    Ok(())
}
