mod support;

mod controller {
    mod bundle_gc;
    mod sync_scenarios;
}
