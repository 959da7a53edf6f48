//! Parse PNG files and print the annotated tree with validation findings.

use anyhow::{bail, Context, Result};
use binform::{png, tree_string, FileSource, Tree};

fn main() -> Result<()> {
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        bail!("usage: png_dump <file.png>...");
    }
    for path in &paths {
        let mut source =
            FileSource::open(path).with_context(|| format!("opening {}", path))?;
        let mut tree = Tree::new();
        let root = png::png()
            .construct(&mut tree, &mut source, None)
            .with_context(|| format!("parsing {}", path))?
            .context("png grammar built no node")?;
        println!("{}", tree_string(&tree, root));
        let mut findings = 0;
        for node in tree.self_and_descendants(root) {
            for issue in tree.issues(node) {
                println!("{}: {}", tree.display_name(node), issue);
                findings += 1;
            }
        }
        if findings == 0 {
            println!("no findings");
        }
    }
    Ok(())
}
