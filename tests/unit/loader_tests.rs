//! Loading images and discovering entry points.

use live_harness::loader::image::{encode_image, ParamDef, RawImage, Visibility};
use live_harness::loader::{self, ImageBuilder, MethodDef, Op, RawType};
use live_harness::AppError;

use super::support;

fn log(message: &str) -> Vec<Op> {
    vec![Op::Log {
        message: message.to_owned(),
    }]
}

fn entry(name: &str, order: i32) -> MethodDef {
    MethodDef::entry_point(name, format!("{name} summary"), order, log(name))
}

fn ty(name: &str, methods: &[MethodDef]) -> RawType {
    methods.iter().fold(RawType::new(name), |ty, method| {
        ty.with_method(method).expect("encode method")
    })
}

#[test]
fn catalog_is_sorted_by_order_key() {
    let built = ImageBuilder::new("menus")
        .with_type(ty("Settings", &[entry("opens", 0)]))
        .with_type(ty("MainMenu", &[entry("opens", -1000)]))
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    let names: Vec<String> = code
        .entry_points()
        .iter()
        .map(|e| e.qualified_name())
        .collect();
    assert_eq!(names, vec!["MainMenu.opens", "Settings.opens"]);

    let catalog = code.catalog();
    assert_eq!(catalog.image, "menus");
    assert_eq!(catalog.entries[0].index, 0);
    assert_eq!(catalog.entries[0].order, -1000);
    assert_eq!(catalog.entries[1].index, 1);
    assert_eq!(catalog.entries[1].summary, "opens summary");
    assert!(catalog.skipped.is_empty());
}

#[test]
fn equal_order_keys_keep_discovery_order() {
    let built = ImageBuilder::new("ties")
        .with_type(ty("B", &[entry("second", 5), entry("third", 5)]))
        .with_type(ty("A", &[entry("first", 1), entry("fourth", 5)]))
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    let names: Vec<String> = code
        .entry_points()
        .iter()
        .map(|e| e.qualified_name())
        .collect();
    assert_eq!(names, vec!["A.first", "B.second", "B.third", "A.fourth"]);
}

#[test]
fn unresolvable_types_are_skipped_and_the_rest_loads() {
    let built = ImageBuilder::new("partial")
        .with_type(ty("Good", &[entry("works", 0)]))
        .with_type(ty("NeedsNet", &[entry("fetches", 1)]).requires("host.net"))
        .with_type(ty("NeedsNetUser", &[entry("uses", 2)]).requires("NeedsNet"))
        .with_type(ty("AlsoGood", &[entry("works", 3)]).requires("Good"))
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    assert_eq!(code.entry_points().len(), 2);
    assert_eq!(
        code.skipped(),
        [
            "type NeedsNet: unresolved dependency 'host.net'".to_owned(),
            "type NeedsNetUser: unresolved dependency 'NeedsNet'".to_owned(),
        ]
    );
}

#[test]
fn corrupt_method_is_skipped_without_losing_siblings() {
    let good = ty("Menu", &[entry("opens", 0)]).with_blob(vec![0xde, 0xad]);
    let built = ImageBuilder::new("corrupt")
        .with_type(good)
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    assert_eq!(code.entry_points().len(), 1);
    assert_eq!(code.skipped().len(), 1);
    assert!(code.skipped()[0].starts_with("type Menu method #1:"));
}

#[test]
fn duplicate_type_is_skipped() {
    let built = ImageBuilder::new("dupes")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .with_type(ty("Menu", &[entry("closes", 1)]))
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    assert_eq!(code.entry_points().len(), 1);
    assert_eq!(code.entry_points()[0].method, "opens");
    assert_eq!(code.skipped(), ["type Menu: declared more than once".to_owned()]);
}

#[test]
fn ineligible_methods_are_not_entry_points() {
    let mut private = entry("private", 0);
    private.visibility = Visibility::Private;
    let mut instance = entry("instance", 0);
    instance.is_static = false;
    let mut with_params = entry("with_params", 0);
    with_params.params.push(ParamDef {
        name: "count".into(),
        type_name: "int".into(),
    });
    let unmarked = MethodDef::new("helper", log("helper"));

    let built = ImageBuilder::new("eligibility")
        .with_type(ty(
            "Menu",
            &[private, instance, with_params, unmarked, entry("ok", 0)],
        ))
        .build()
        .expect("build");

    let code = loader::load(&built.image, None, &support::modules()).expect("load");
    let names: Vec<&str> = code.entry_points().iter().map(|e| e.method.as_str()).collect();
    assert_eq!(names, vec!["ok"]);
    assert!(code.skipped().is_empty());
}

#[test]
fn unknown_import_fails_the_whole_image() {
    let built = ImageBuilder::new("imports")
        .import("host.net")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .build()
        .expect("build");

    let err = loader::load(&built.image, None, &support::modules()).expect_err("unknown import");
    assert!(matches!(err, AppError::Load(_)));
    assert!(err.to_string().contains("host.net"), "{err}");
}

#[test]
fn garbage_is_not_an_image() {
    let err = loader::load(b"not an image", None, &support::modules()).expect_err("bad magic");
    assert!(matches!(err, AppError::Load(_)));

    let err = loader::load(&[], None, &support::modules()).expect_err("empty");
    assert!(matches!(err, AppError::Load(_)));
}

#[test]
fn future_format_version_is_refused() {
    let mut image = encode_image(&RawImage {
        name: "future".into(),
        imports: Vec::new(),
        types: Vec::new(),
    })
    .expect("encode");
    image[4] = 0xff;

    let err = loader::load(&image, None, &support::modules()).expect_err("version");
    assert!(matches!(err, AppError::Load(_)));
}

#[test]
fn undecodable_symbols_are_ignored() {
    let built = ImageBuilder::new("symbols")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .build()
        .expect("build");

    let code = loader::load(&built.image, Some(&[1, 2, 3]), &support::modules())
        .expect("symbols are optional");
    assert_eq!(code.entry_points().len(), 1);
}

#[test]
fn digest_identifies_the_image_bytes() {
    let a = ImageBuilder::new("a")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .build()
        .expect("build");
    let b = ImageBuilder::new("b")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .build()
        .expect("build");

    let modules = support::modules();
    let first = loader::load(&a.image, None, &modules).expect("load");
    let again = loader::load(&a.image, None, &modules).expect("load");
    let other = loader::load(&b.image, None, &modules).expect("load");

    assert_eq!(first.digest().len(), 64);
    assert_eq!(first.digest(), again.digest());
    assert_ne!(first.digest(), other.digest());
}

#[test]
fn instantiate_rejects_unknown_index() {
    let built = ImageBuilder::new("one")
        .with_type(ty("Menu", &[entry("opens", 0)]))
        .build()
        .expect("build");
    let code = loader::load(&built.image, None, &support::modules()).expect("load");

    assert!(code.instantiate(0).is_ok());
    assert!(matches!(code.instantiate(1), Err(AppError::NotFound(_))));
}
