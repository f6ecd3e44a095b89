/*!

The custom resource definitions are modeled as Rust structs. Here we generate
the corresponding k8s yaml file, to be applied before the controller starts.

!*/

use kube::CustomResourceExt;
use models::cycle::{CycleNodeRequest, CycleNodeStatus};
use std::error::Error;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

const DEPLOY_DIR: &str = env!("CARGO_MANIFEST_DIR");
const HEADER: &str = "# This file is generated. Do not edit.\n";
const YAML_DOC_LEADER: &str = "---\n";

fn main() -> Result<(), Box<dyn Error>> {
    // Re-run this build script if the model changes.
    println!("cargo:rerun-if-changed=../models/src");

    let dir = PathBuf::from(DEPLOY_DIR).join("crds");
    fs::create_dir_all(&dir)?;
    let mut crds = File::create(dir.join("cyclops-crds.yaml"))?;

    crds.write_all(HEADER.as_bytes())?;
    for crd in [CycleNodeRequest::crd(), CycleNodeStatus::crd()] {
        crds.write_all(YAML_DOC_LEADER.as_bytes())?;
        serde_yaml::to_writer(&crds, &crd)?;
    }
    Ok(())
}
