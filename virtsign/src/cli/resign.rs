// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The resign/verify pipeline: builds the task graph for one run over the
//! payload's image set and drives it to completion.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    slice,
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tracing::info;

use crate::{
    avb::AvbTool,
    check::FingerprintSlot,
    cli::args::Cli,
    compress::Lz4,
    container,
    format::avbinfo::{ImageInfo, PUBLIC_KEY_PROPERTY},
    graph::{TaskGraph, TaskHandle},
    images::{ImageSet, KernelEntry, SigningKey},
    patch,
};

/// State shared by every task of one run.
struct RunContext {
    avb: AvbTool,
    lz4: Lz4,
    key: SigningKey,
    images: ImageSet,
    fingerprint: FingerprintSlot,
    update_bootconfigs: bool,
    validate_avb_version: bool,
}

fn run_context(cli: &Cli) -> Arc<RunContext> {
    let signing_args = cli
        .signing_args
        .as_deref()
        .map(|args| args.split_whitespace().map(str::to_owned).collect())
        .unwrap_or_default();

    Arc::new(RunContext {
        avb: AvbTool::new(cli.avbtool.clone(), signing_args),
        lz4: Lz4::new(),
        key: SigningKey::new(cli.key.clone(), cli.key_override.clone()),
        images: ImageSet::resolve(&cli.input_dir),
        fingerprint: FingerprintSlot::new(),
        update_bootconfigs: !cli.do_not_update_bootconfigs,
        validate_avb_version: !cli.do_not_validate_avb_version,
    })
}

fn submit_unpack(graph: &TaskGraph, ctx: &Arc<RunContext>, scratch: &Path) -> TaskHandle {
    let ctx = ctx.clone();
    let dir = scratch.to_path_buf();

    graph.submit("unpack super", &[], move || {
        container::unpack(&ctx.images.super_image, &dir)
            .with_context(|| format!("Failed to unpack: {:?}", ctx.images.super_image))?;
        Ok(())
    })
}

/// Salts of the kernel's initrd hash descriptors, keyed off the old
/// metadata. The stub images must reuse them so that only the digests
/// change.
fn kernel_salts(entry: &KernelEntry, info: &ImageInfo) -> Result<(String, String)> {
    let descriptors = info
        .hash_descriptors()
        .with_context(|| format!("Bad metadata in kernel: {:?}", entry.kernel))?;

    let salt = |partition: &str| {
        descriptors
            .get(partition)
            .and_then(|fields| fields.get("Salt"))
            .cloned()
            .with_context(|| {
                format!(
                    "No {partition} hash descriptor in kernel: {:?}",
                    entry.kernel,
                )
            })
    };

    Ok((salt("initrd_normal")?, salt("initrd_debug")?))
}

pub fn sign_main(cli: &Cli) -> Result<()> {
    let ctx = run_context(cli);
    let scratch = TempDir::new().context("Failed to create scratch directory")?;
    let graph = TaskGraph::new();

    info!("Re-signing images in {:?}", cli.input_dir);

    // Everything else depends on which partitions the super image actually
    // contains, so the unpack is awaited before the rest of the graph is
    // wired up.
    let unpack = submit_unpack(&graph, &ctx, scratch.path());
    graph.await_all(slice::from_ref(&unpack))?;

    let system_image = scratch
        .path()
        .join(format!("{}.img", container::SYSTEM_PARTITION));
    let vendor_image = scratch
        .path()
        .join(format!("{}.img", container::VENDOR_PARTITION));

    let submit_partition = |partition: &str, image: &Path| {
        let ctx = ctx.clone();
        let image = image.to_path_buf();

        graph.submit(format!("resign {partition}"), slice::from_ref(&unpack), move || {
            patch::footer::add_hash_tree_footer(&ctx.avb, &ctx.key, &ctx.fingerprint, &image)?;
            Ok(())
        })
    };

    let mut partitions = BTreeMap::new();
    partitions.insert(container::SYSTEM_PARTITION.to_owned(), system_image.clone());
    let mut partition_tasks = vec![submit_partition(container::SYSTEM_PARTITION, &system_image)];

    if vendor_image.exists() {
        partitions.insert(container::VENDOR_PARTITION.to_owned(), vendor_image.clone());
        partition_tasks.push(submit_partition(container::VENDOR_PARTITION, &vendor_image));
    }

    let include_images = partitions.values().cloned().collect::<Vec<_>>();

    let repack = {
        let ctx = ctx.clone();

        graph.submit("repack super", &partition_tasks, move || {
            container::pack(&partitions, &ctx.images.super_image)
                .with_context(|| format!("Failed to repack: {:?}", ctx.images.super_image))?;
            Ok(())
        })
    };

    let vbmeta_task = {
        let ctx = ctx.clone();
        let include = include_images;

        graph.submit("rebuild vbmeta", slice::from_ref(&repack), move || {
            patch::footer::make_vbmeta_image(
                &ctx.avb,
                &ctx.key,
                &ctx.fingerprint,
                &ctx.images.vbmeta,
                &include,
            )?;
            Ok(())
        })
    };

    let bootconfig_task = if ctx.update_bootconfigs {
        let ctx = ctx.clone();

        Some(graph.submit("update bootconfigs", &[vbmeta_task], move || {
            patch::bootconfig::update_initrds(
                &ctx.avb,
                &ctx.images.initrds(),
                &ctx.images.vbmeta,
                ctx.validate_avb_version,
            )?;
            Ok(())
        }))
    } else {
        None
    };

    // The stub images are keyed by the post-patch initrd content, so they
    // must wait for the bootconfig update when it is enabled.
    let stub_deps = bootconfig_task.into_iter().collect::<Vec<_>>();

    let mut kernel_tasks = Vec::new();
    let mut original_kernels = Vec::new();

    for entry in ctx.images.kernels() {
        let old_info = ctx
            .avb
            .image_info(&entry.kernel)
            .with_context(|| format!("Failed to inspect kernel: {:?}", entry.kernel))?
            .with_context(|| format!("No metadata in kernel: {:?}", entry.kernel))?;
        let (normal_salt, debug_salt) = kernel_salts(&entry, &old_info)?;

        // The kernel may be lz4-compressed; the footer rebuild then runs on
        // a scratch copy that is recompressed in place afterwards. The
        // scratch copy keeps the original file name so key overrides still
        // apply.
        let compressed = ctx
            .lz4
            .is_compressed(&entry.kernel)
            .with_context(|| format!("Failed to probe kernel: {:?}", entry.kernel))?;

        let (work_kernel, decompress_task) = if compressed {
            let dir = scratch.path().join(&entry.name);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {dir:?}"))?;
            let file_name = entry
                .kernel
                .file_name()
                .with_context(|| format!("Kernel path has no file name: {:?}", entry.kernel))?;
            let work_kernel = dir.join(file_name);

            let task = {
                let ctx = ctx.clone();
                let source = entry.kernel.clone();
                let target = work_kernel.clone();

                graph.submit(format!("decompress {}", entry.name), &[], move || {
                    ctx.lz4
                        .decompress(&source, &target)
                        .with_context(|| format!("Failed to decompress: {source:?}"))?;
                    Ok(())
                })
            };

            (work_kernel, Some(task))
        } else {
            (entry.kernel.clone(), None)
        };

        let submit_stub = |partition: &'static str, initrd: &Path, salt: String| {
            let ctx = ctx.clone();
            let initrd = initrd.to_path_buf();
            let output = scratch
                .path()
                .join(format!("{}_{partition}.hashdesc", entry.name));
            let task = {
                let output = output.clone();

                graph.submit(
                    format!("hash stub {partition} ({})", entry.name),
                    &stub_deps,
                    move || {
                        ctx.avb
                            .generate_hash_stub(&initrd, &output, partition, &salt)
                            .with_context(|| format!("Failed to generate stub for: {initrd:?}"))?;
                        Ok(())
                    },
                )
            };

            (output, task)
        };

        let (normal_stub, normal_task) =
            submit_stub("initrd_normal", &entry.initrd_normal, normal_salt);
        let (debug_stub, debug_task) = submit_stub("initrd_debug", &entry.initrd_debug, debug_salt);

        let mut footer_deps = vec![normal_task, debug_task];
        footer_deps.extend(decompress_task.iter().cloned());

        let footer_task = {
            let ctx = ctx.clone();
            let image = work_kernel.clone();
            let stubs = vec![normal_stub, debug_stub];

            graph.submit(format!("resign {}", entry.name), &footer_deps, move || {
                patch::footer::add_hash_footer(&ctx.avb, &ctx.key, &ctx.fingerprint, &image, &stubs)?;
                Ok(())
            })
        };

        let kernel_done = if compressed {
            let ctx = ctx.clone();
            let source = work_kernel;
            let target = entry.kernel.clone();

            graph.submit(format!("recompress {}", entry.name), &[footer_task], move || {
                ctx.lz4
                    .compress(&source, &target)
                    .with_context(|| format!("Failed to recompress: {target:?}"))?;
                Ok(())
            })
        } else {
            footer_task
        };

        kernel_tasks.push(kernel_done);
        original_kernels.push((entry, old_info));
    }

    // Rialto only exists on arm64 targets. It embeds copies of the kernels'
    // initrd digests, which must be patched before its own footer rebuild.
    if ctx.images.rialto.exists() {
        let patch_task = {
            let ctx = ctx.clone();

            graph.submit("patch rialto initrd digests", &kernel_tasks, move || {
                patch_rialto_digests(&ctx, &original_kernels)
            })
        };

        let ctx = ctx.clone();
        graph.submit("resign rialto", &[patch_task], move || resign_rialto(&ctx));
    }

    graph.run_to_completion()?;

    info!("Successfully re-signed all images");

    Ok(())
}

fn patch_rialto_digests(ctx: &RunContext, kernels: &[(KernelEntry, ImageInfo)]) -> Result<()> {
    // Without the bootconfig update, the initrds (and thus the embedded
    // digests) are unchanged.
    if !ctx.update_bootconfigs {
        return Ok(());
    }

    let rialto = &ctx.images.rialto;
    let mut blob =
        fs::read(rialto).with_context(|| format!("Failed to read for patching: {rialto:?}"))?;

    for (entry, old_info) in kernels {
        let new_info = ctx
            .avb
            .image_info(&entry.kernel)
            .with_context(|| format!("Failed to inspect kernel: {:?}", entry.kernel))?
            .with_context(|| format!("No metadata in resigned kernel: {:?}", entry.kernel))?;

        let old_digests = patch::rialto::hash_digests(old_info)
            .with_context(|| format!("Bad metadata in kernel: {:?}", entry.kernel))?;
        let new_digests = patch::rialto::hash_digests(&new_info)
            .with_context(|| format!("Bad metadata in resigned kernel: {:?}", entry.kernel))?;

        patch::rialto::patch_digests(&entry.name, &old_digests, &new_digests, &mut blob)?;
    }

    fs::write(rialto, blob).with_context(|| format!("Failed to write patched: {rialto:?}"))?;

    Ok(())
}

fn resign_rialto(ctx: &RunContext) -> Result<()> {
    let rialto = &ctx.images.rialto;

    let old_info = ctx
        .avb
        .image_info(rialto)
        .with_context(|| format!("Failed to inspect: {rialto:?}"))?;

    patch::footer::add_hash_footer(&ctx.avb, &ctx.key, &ctx.fingerprint, rialto, &[])?;

    let new_info = ctx
        .avb
        .image_info(rialto)?
        .with_context(|| format!("No metadata in resigned image: {rialto:?}"))?;
    patch::rialto::check_resigned_rialto(old_info.as_ref(), &new_info, ctx.update_bootconfigs)
        .with_context(|| format!("Unexpected metadata after resigning: {rialto:?}"))?;

    Ok(())
}

fn check_public_key(ctx: &RunContext, image: &Path, expected: &str) -> Result<()> {
    let info = ctx
        .avb
        .image_info(image)
        .with_context(|| format!("Failed to inspect: {image:?}"))?
        .with_context(|| format!("No metadata in image: {image:?}"))?;
    let actual = info
        .require_property(PUBLIC_KEY_PROPERTY)
        .with_context(|| format!("Bad metadata in image: {image:?}"))?;

    if actual != expected {
        bail!("Public key mismatch for {image:?}: expected {expected}, got {actual}");
    }

    Ok(())
}

pub fn verify_main(cli: &Cli) -> Result<()> {
    let ctx = run_context(cli);
    let scratch = TempDir::new().context("Failed to create scratch directory")?;
    let graph = TaskGraph::new();

    info!("Verifying images in {:?}", cli.input_dir);

    let unpack = submit_unpack(&graph, &ctx, scratch.path());

    let expected = Arc::new(
        ctx.avb
            .key_fingerprint(&cli.key)
            .with_context(|| format!("Failed to compute key fingerprint: {:?}", cli.key))?,
    );

    let submit_check = |name: String, image: PathBuf, deps: &[TaskHandle]| {
        let ctx = ctx.clone();
        let expected = expected.clone();

        graph.submit(name, deps, move || check_public_key(&ctx, &image, &expected));
    };

    // The super image itself carries no footer; its unpacked primary
    // partition is checked instead. The initrds are not independently
    // checkable, only through the kernels' descriptors.
    submit_check(
        format!("check {}", container::SYSTEM_PARTITION),
        scratch
            .path()
            .join(format!("{}.img", container::SYSTEM_PARTITION)),
        slice::from_ref(&unpack),
    );
    submit_check("check vbmeta".to_owned(), ctx.images.vbmeta.clone(), &[]);
    for entry in ctx.images.kernels() {
        submit_check(format!("check {}", entry.name), entry.kernel, &[]);
    }
    if ctx.images.rialto.exists() {
        submit_check("check rialto".to_owned(), ctx.images.rialto.clone(), &[]);
    }

    graph.run_to_completion()?;

    info!("Successfully verified all images");

    Ok(())
}
