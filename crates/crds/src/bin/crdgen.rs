//! Prints the CRD manifests as a multi-document YAML stream.

use crds::{AWSCluster, AWSMachine};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [AWSCluster::crd(), AWSMachine::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
