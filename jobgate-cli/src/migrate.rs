//! `jobgate migrate ...`

use std::path::{Path, PathBuf};

use anyhow::Context;
use jobgate::migrate::{autogen, StepDirection};
use jobgate::{db, model, Migrator, RevisionSet, Settings, Target};

use crate::cli::{MigrateAction, RevisionArgs};

pub async fn run(action: MigrateAction, migrations_dir: Option<&Path>) -> anyhow::Result<()> {
    match action {
        MigrateAction::Upgrade { target } => {
            let target: Target = target.parse()?;
            let migrator = open(migrations_dir).await?;
            print_steps(&migrator.upgrade(&target).await?);
        }
        MigrateAction::Downgrade { target } => {
            let target: Target = target.parse()?;
            let migrator = open(migrations_dir).await?;
            print_steps(&migrator.downgrade(&target).await?);
        }
        MigrateAction::Current => match open(migrations_dir).await?.current().await? {
            Some(id) => println!("{id}"),
            None => println!("base"),
        },
        MigrateAction::History => {
            for status in open(migrations_dir).await?.history().await? {
                let marker = match (status.current, status.applied) {
                    (true, _) => "(current)",
                    (false, true) => "(applied)",
                    (false, false) => "",
                };
                println!("{} {} {}", status.id, status.slug, marker);
            }
        }
        MigrateAction::Revision(args) => revision(args, migrations_dir).await?,
    }
    Ok(())
}

async fn open(migrations_dir: Option<&Path>) -> anyhow::Result<Migrator> {
    let revisions = revisions(migrations_dir)?;
    let settings = Settings::from_env()?;
    let pool = db::connect(&settings.database)
        .await
        .context("cannot open the store")?;
    Ok(Migrator::new(pool, revisions))
}

async fn revision(args: RevisionArgs, migrations_dir: Option<&Path>) -> anyhow::Result<()> {
    let dir = args
        .dir
        .or_else(|| migrations_dir.map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("migrations"));

    let pool = if args.autogenerate {
        let settings = Settings::from_env()?;
        Some(db::connect(&settings.database).await?)
    } else {
        None
    };

    let generated =
        autogen::generate(&dir, &args.message, model::declared(), pool.as_ref()).await?;
    if let Some(pool) = pool {
        pool.close().await;
    }

    println!(
        "revision {} with {} change(s): {}",
        generated.id,
        generated.changes,
        generated.up_path.display()
    );
    if args.autogenerate && generated.changes == 0 {
        println!("the store already matches the declared model");
    }
    Ok(())
}

fn revisions(dir: Option<&Path>) -> anyhow::Result<RevisionSet> {
    match dir {
        Some(dir) => RevisionSet::from_dir(dir)
            .with_context(|| format!("cannot load revisions from {}", dir.display())),
        None => Ok(RevisionSet::embedded()),
    }
}

fn print_steps(steps: &[jobgate::migrate::Step]) {
    if steps.is_empty() {
        println!("nothing to do");
    }
    for step in steps {
        let verb = match step.direction {
            StepDirection::Up => "applied",
            StepDirection::Down => "reverted",
        };
        println!("{verb} {} {}", step.revision, step.slug);
    }
}
