//! Generate CRD YAML from Rust types.
//!
//! Usage:
//!   cargo run --bin crdgen              # all CRDs to stdout
//!   cargo run --bin crdgen -- --out-dir ./crds   # one file per CRD

use std::path::PathBuf;

use kube::ResourceExt;
use pgstack_operator::crd::all_crds;

fn main() -> anyhow::Result<()> {
    let out_dir: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out-dir")
        .nth(1)
        .map(PathBuf::from);

    let mut crds = Vec::new();
    for crd in all_crds() {
        let file = format!("{}-crd.yaml", crd.spec.names.singular.clone().unwrap_or_else(|| crd.name_any()));
        crds.push((file, serde_yaml::to_string(&crd)?));
    }

    match out_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            for (name, yaml) in &crds {
                let path = dir.join(name);
                std::fs::write(&path, format!("---\n{yaml}"))?;
                eprintln!("wrote {}", path.display());
            }
        }
        None => {
            for (_name, yaml) in &crds {
                println!("---\n{yaml}");
            }
        }
    }
    Ok(())
}
